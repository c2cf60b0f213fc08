use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use imap_operation::ops::{FetchMessages, Noop, SelectFolder};
use imap_operation::{
    CancelToken, ClientBuilder, ConnectionMode, ConnectionProvider, Credentials, ErrorCode,
    ErrorDomain, Flag, Operation, OperationQueue, SessionPool,
};

const WAIT: Duration = Duration::from_secs(5);

fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn pool(port: u16, password: &str, test_on_lease: bool) -> Arc<SessionPool> {
    let mut builder = ClientBuilder::new("127.0.0.1", port);
    builder.mode(ConnectionMode::Plaintext);
    Arc::new(
        SessionPool::builder(builder)
            .credentials(Credentials::login("user", password))
            .test_on_lease(test_on_lease)
            .build(),
    )
}

/// Accepts connections and never sends a byte. Returns the port and the number accepted.
fn mute_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    thread::spawn(move || {
        let mut open = Vec::new();
        for stream in listener.incoming().flatten() {
            counter.fetch_add(1, Ordering::SeqCst);
            open.push(stream);
        }
    });
    (port, accepted)
}

/// A tiny IMAP server speaking just enough of the protocol for these tests.
///
/// The password is always `secret`. Selecting `Slow` never gets an answer, and fetching
/// message `9` answers with a broken line in the middle of the response.
struct Server {
    port: u16,
    accepted: Arc<AtomicUsize>,
    slow: Mutex<Receiver<()>>,
}

impl Server {
    fn start() -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (slow_tx, slow_rx) = mpsc::channel();

        let counter = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let slow = slow_tx.clone();
                thread::spawn(move || serve(stream, slow));
            }
        });

        Server {
            port,
            accepted,
            slow: Mutex::new(slow_rx),
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn wait_for_slow_command(&self) {
        self.slow.lock().unwrap().recv_timeout(WAIT).unwrap();
    }

    fn pool(&self, password: &str) -> Arc<SessionPool> {
        pool(self.port, password, true)
    }
}

fn serve(stream: TcpStream, slow: Sender<()>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;
    let _ = writer.write_all(b"* OK test server ready\r\n");

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let mut parts = line.trim_end().splitn(3, ' ');
        let tag = parts.next().unwrap_or("*").to_string();
        let command = parts.next().unwrap_or("").to_ascii_uppercase();
        let args = parts.next().unwrap_or("");

        let reply = match command.as_str() {
            "CAPABILITY" => format!(
                "* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\n{} OK CAPABILITY completed\r\n",
                tag
            ),
            "LOGIN" => {
                if args.ends_with(" \"secret\"") {
                    format!("{} OK LOGIN completed\r\n", tag)
                } else {
                    format!("{} NO invalid credentials\r\n", tag)
                }
            }
            "NOOP" => format!("{} OK NOOP completed\r\n", tag),
            "SELECT" | "EXAMINE" if args == "\"Slow\"" => {
                let _ = slow.send(());
                continue;
            }
            "SELECT" | "EXAMINE" if args == "\"INBOX\"" => {
                let access = if command == "SELECT" {
                    "READ-WRITE"
                } else {
                    "READ-ONLY"
                };
                format!(
                    "* FLAGS (\\Seen \\Deleted)\r\n\
                     * 2 EXISTS\r\n\
                     * 0 RECENT\r\n\
                     * OK [UIDVALIDITY 42] UIDs valid\r\n\
                     {} OK [{}] {} completed\r\n",
                    tag, access, command
                )
            }
            "SELECT" | "EXAMINE" => format!("{} NO no such mailbox\r\n", tag),
            "FETCH" if args.starts_with("9 ") => format!(
                "* 9 FETCH (UID 19 FLAGS ())\r\n\
                 )garbage(\r\n\
                 * 9 FETCH (UID 19 FLAGS (\\Seen))\r\n\
                 {} OK FETCH completed\r\n",
                tag
            ),
            "FETCH" | "UID" => format!(
                "* 1 FETCH (UID 10 FLAGS (\\Seen))\r\n\
                 * 2 FETCH (UID 11 FLAGS ())\r\n\
                 {} OK FETCH completed\r\n",
                tag
            ),
            "LOGOUT" => {
                let _ = writer.write_all(
                    format!("* BYE logging out\r\n{} OK LOGOUT completed\r\n", tag).as_bytes(),
                );
                return;
            }
            _ => format!("{} BAD unknown command\r\n", tag),
        };
        if writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

#[test_log::test]
fn select_through_pool() {
    let server = Server::start();
    let select = Operation::builder(SelectFolder::new("INBOX"))
        .provider(server.pool("secret"))
        .build();

    let mailbox = select.spawn().unwrap().wait().unwrap();
    assert_eq!(mailbox.exists, 2);
    assert_eq!(mailbox.uid_validity, Some(42));
    assert!(mailbox.flags.contains(&Flag::Seen));
    assert!(select.is_finished());
}

#[test_log::test]
fn fetch_examines_then_fetches() {
    let server = Server::start();
    let fetch = Operation::builder(FetchMessages::new("INBOX", "1:2", "(UID FLAGS)").uid())
        .provider(server.pool("secret"))
        .build();

    let messages = fetch.spawn().unwrap().wait().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].uid, Some(10));
    assert_eq!(messages[0].flags(), &[Flag::Seen][..]);
    assert!(messages[1].flags().is_empty());
}

#[test_log::test]
fn sessions_are_reused() {
    let server = Server::start();
    let pool = server.pool("secret");

    for _ in 0..3 {
        let op = Operation::builder(Noop).provider(pool.clone()).build();
        op.spawn().unwrap().wait().unwrap();
    }
    assert_eq!(server.accepted(), 1);
    assert_eq!(pool.idle_count(), 1);
}

#[test_log::test]
fn wrong_password_is_an_auth_failure() {
    let server = Server::start();
    let op = Operation::builder(Noop)
        .provider(server.pool("hunter2"))
        .build();

    let err = op.spawn().unwrap().wait().unwrap_err();
    assert_eq!(err.domain(), ErrorDomain::Auth);
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    assert!(op.is_finished());
}

#[test_log::test]
fn missing_mailbox_is_rejected_and_session_kept() {
    let server = Server::start();
    let pool = server.pool("secret");
    let op = Operation::builder(SelectFolder::new("Nowhere"))
        .provider(pool.clone())
        .build();

    let err = op.spawn().unwrap().wait().unwrap_err();
    assert_eq!(err.domain(), ErrorDomain::Protocol);
    assert_eq!(err.code(), ErrorCode::Rejected);
    assert_eq!(pool.idle_count(), 1);
}

#[test_log::test]
fn missing_credentials() {
    let server = Server::start();
    let mut builder = ClientBuilder::new("127.0.0.1", server.port);
    builder.mode(ConnectionMode::Plaintext);
    let pool = SessionPool::builder(builder).build();

    match pool.lease(&CancelToken::new(), None) {
        Err(e) => assert_eq!(
            imap_operation::OperationError::from(e).code(),
            ErrorCode::AuthenticationRequired
        ),
        Ok(_) => panic!("leased a session without credentials"),
    }
}

#[test_log::test]
fn connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut builder = ClientBuilder::new("127.0.0.1", port);
    builder.mode(ConnectionMode::Plaintext);
    let pool = SessionPool::builder(builder)
        .credentials(Credentials::login("user", "secret"))
        .build();

    let op = Operation::builder(Noop).provider(Arc::new(pool)).build();
    let err = op.spawn().unwrap().wait().unwrap_err();
    assert_eq!(err.domain(), ErrorDomain::Network);
    assert_eq!(err.code(), ErrorCode::ConnectionFailed);
}

#[test_log::test]
fn cancel_aborts_blocked_read() {
    let server = Server::start();
    let pool = server.pool("secret");
    let op = Operation::builder(SelectFolder::new("Slow"))
        .provider(pool.clone())
        .build();

    let mut completion = op.spawn().unwrap();
    server.wait_for_slow_command();
    assert_eq!(completion.try_wait(), None);

    op.cancel();
    let err = completion.wait_timeout(WAIT).unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(op.is_cancelled());

    // released before the outcome arrived, and not handed out again
    assert_eq!(pool.idle_count(), 0);
    let noop = Operation::builder(Noop).provider(pool).build();
    noop.spawn().unwrap().wait().unwrap();
    assert_eq!(server.accepted(), 2);
}

#[test_log::test]
fn silent_server_times_out() {
    let server = Server::start();
    let pool = server.pool("secret");
    let op = Operation::builder(SelectFolder::new("Slow").read_only())
        .provider(pool.clone())
        .timeout(Duration::from_millis(200))
        .build();

    let err = op.spawn().unwrap().wait().unwrap_err();
    assert_eq!(err.domain(), ErrorDomain::Network);
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(op.is_finished());
    assert_eq!(pool.idle_count(), 0);
}

#[test_log::test]
fn silent_greeting_times_out() {
    let (port, accepted) = mute_server();
    let op = Operation::builder(Noop)
        .provider(pool(port, "secret", true))
        .timeout(Duration::from_millis(200))
        .build();

    let mut completion = op.spawn().unwrap();
    let err = completion
        .wait_timeout(WAIT)
        .expect("no outcome from a silent server")
        .unwrap_err();
    assert_eq!(err.domain(), ErrorDomain::Network);
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert!(op.is_finished());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[test_log::test]
fn cancel_aborts_a_silent_greeting() {
    let (port, accepted) = mute_server();
    let op = Operation::builder(Noop)
        .provider(pool(port, "secret", true))
        .build();

    let mut completion = op.spawn().unwrap();
    assert!(eventually(|| accepted.load(Ordering::SeqCst) == 1));
    op.cancel();
    let err = completion
        .wait_timeout(WAIT)
        .expect("cancel did not unblock the greeting")
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test_log::test]
fn cancelled_connect_frees_its_queue_slot() {
    let (port, accepted) = mute_server();
    let queue = OperationQueue::new(1);

    let stuck = Operation::builder(Noop)
        .provider(pool(port, "secret", true))
        .build();
    let mut stuck_done = stuck.completion().unwrap();
    queue.enqueue(&stuck).unwrap();
    assert!(eventually(|| accepted.load(Ordering::SeqCst) == 1));
    assert_eq!(queue.running_count(), 1);

    queue.cancel_all();
    let next = Operation::from_fn(|_| Ok("next"));
    let mut next_done = next.completion().unwrap();
    queue.enqueue(&next).unwrap();

    assert!(stuck_done.wait_timeout(WAIT).unwrap().unwrap_err().is_cancelled());
    assert_eq!(next_done.wait_timeout(WAIT), Some(Ok("next")));
    assert!(queue.wait_idle_timeout(WAIT));
    assert_eq!(queue.running_count(), 0);
}

#[test_log::test]
fn garbled_response_discards_the_session() {
    let server = Server::start();
    let pool = pool(server.port, "secret", false);

    let garbled = Operation::builder(FetchMessages::new("INBOX", "9", "(UID FLAGS)"))
        .provider(pool.clone())
        .build();
    let err = garbled.spawn().unwrap().wait().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ParseError);
    assert_eq!(pool.idle_count(), 0);

    // no NOOP check on lease, so reuse would read the rest of the broken response
    let fetch = Operation::builder(FetchMessages::new("INBOX", "1:2", "(UID FLAGS)"))
        .provider(pool.clone())
        .build();
    assert_eq!(fetch.spawn().unwrap().wait().unwrap().len(), 2);
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.idle_count(), 1);
}

#[test_log::test]
fn queued_operations_share_the_pool() {
    let server = Server::start();
    let pool = server.pool("secret");
    let queue = OperationQueue::new(2);

    let ops: Vec<_> = (0..6)
        .map(|_| {
            Operation::builder(FetchMessages::new("INBOX", "1:2", "(UID FLAGS)"))
                .provider(pool.clone())
                .build()
        })
        .collect();
    let completions: Vec<_> = ops.iter().map(|op| op.completion().unwrap()).collect();
    for op in &ops {
        queue.enqueue(op).unwrap();
    }

    for completion in completions {
        assert_eq!(completion.wait().unwrap().len(), 2);
    }
    assert!(queue.wait_idle_timeout(WAIT));
    assert!(server.accepted() <= 2);
}
