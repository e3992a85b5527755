//! Full-session tests against a scripted SOCKS5 proxy that doubles as the
//! destination mail server.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use smtp_socks_r::session::{
    REPLY_CLOSING, REPLY_INVALID, REPLY_NO_CONNECT, REPLY_REJECTED, REPLY_TIMED_OUT,
    REPLY_WELCOME,
};
use smtp_socks_r::{run_session, Outcome, Result, SessionOptions};

fn read_line<S: Read>(stream: &mut S) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "stream closed mid-line: {:?}", String::from_utf8_lossy(&line));
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
    }
}

fn reply(text: &str) -> String {
    format!("{}\r\n", text)
}

fn options_for(proxy: &TcpListener) -> SessionOptions {
    SessionOptions {
        proxy_host: "127.0.0.1".to_string(),
        proxy_port: proxy.local_addr().unwrap().port(),
        negotiation_timeout: Duration::from_secs(5),
        greeting_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
        ..SessionOptions::default()
    }
}

/// Start the session on one end of a socket pair; the other end is the
/// test's client.
fn start_session(options: SessionOptions) -> (UnixStream, thread::JoinHandle<Result<Outcome>>) {
    let (mut server_end, client) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || run_session(&mut server_end, &options));
    (client, handle)
}

/// Accept one connection and play the proxy side of the handshake with reply
/// code `rep`. Returns the stream and the requested (host, port).
fn accept_socks(listener: &TcpListener, rep: u8) -> (TcpStream, String, u16) {
    let (mut stream, _) = listener.accept().unwrap();

    let mut greeting = [0u8; 3];
    stream.read_exact(&mut greeting).unwrap();
    assert_eq!(greeting, [0x05, 0x01, 0x00]);
    stream.write_all(&[0x05, 0x00]).unwrap();

    let mut head = [0u8; 5];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
    let mut rest = vec![0u8; head[4] as usize + 2];
    stream.read_exact(&mut rest).unwrap();
    let (host, port) = rest.split_at(head[4] as usize);
    let host = String::from_utf8(host.to_vec()).unwrap();
    let port = u16::from_be_bytes([port[0], port[1]]);

    stream
        .write_all(&[0x05, rep, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
        .unwrap();
    (stream, host, port)
}

#[test]
fn test_full_session_relays_after_ehlo() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut client, session) = start_session(options_for(&proxy));

    let upstream = thread::spawn(move || {
        let (mut stream, host, port) = accept_socks(&proxy, 0x00);
        assert_eq!(host, "target.example.com");
        assert_eq!(port, 25);

        stream.write_all(b"220 target.example.com ESMTP\r\n").unwrap();
        assert_eq!(read_line(&mut stream), "EHLO mybox.onion\r\n");
        stream.write_all(b"250 target.example.com\r\n").unwrap();

        assert_eq!(read_line(&mut stream), "QUIT\r\n");
        stream.write_all(b"221 bye\r\n").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client
        .write_all(b"EHLO mybox.onion target.example.com\r\n")
        .unwrap();
    assert_eq!(read_line(&mut client), "250 target.example.com\r\n");

    client.write_all(b"QUIT\r\n").unwrap();
    assert_eq!(read_line(&mut client), "221 bye\r\n");
    client.shutdown(Shutdown::Write).unwrap();

    upstream.join().unwrap();
    match session.join().unwrap().unwrap() {
        Outcome::Relayed(stats) => {
            assert_eq!(stats.local_to_remote, 6);
            assert_eq!(stats.remote_to_local, 24 + 9);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_lowercase_helo_verb_is_forwarded_as_typed() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut client, session) = start_session(options_for(&proxy));

    let upstream = thread::spawn(move || {
        let (mut stream, host, _) = accept_socks(&proxy, 0x00);
        assert_eq!(host, "mx.example.org");
        stream.write_all(b"220 ready\r\n").unwrap();
        assert_eq!(read_line(&mut stream), "helo me.example\r\n");
    });

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"helo me.example mx.example.org\n").unwrap();
    upstream.join().unwrap();

    // Upstream closed without a word; the client finishing ends the relay.
    client.shutdown(Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(matches!(
        session.join().unwrap().unwrap(),
        Outcome::Relayed(_)
    ));
}

#[test]
fn test_local_name_bytes_reach_upstream_unchanged() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut client, session) = start_session(options_for(&proxy));

    let upstream = thread::spawn(move || {
        let (mut stream, host, _) = accept_socks(&proxy, 0x00);
        assert_eq!(host, "mx.example.org");
        stream.write_all(b"220 ready\r\n").unwrap();

        let expected = b"EHLO my\xffbox\r\n";
        let mut line = [0u8; 13];
        stream.read_exact(&mut line).unwrap();
        assert_eq!(&line, expected);
    });

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client
        .write_all(b"EHLO my\xffbox mx.example.org\r\n")
        .unwrap();
    upstream.join().unwrap();

    client.shutdown(Shutdown::Write).unwrap();
    assert!(matches!(
        session.join().unwrap().unwrap(),
        Outcome::Relayed(_)
    ));
}

#[test]
fn test_upstream_rejection_is_not_forwarded() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut client, session) = start_session(options_for(&proxy));

    let upstream = thread::spawn(move || {
        let (mut stream, _, _) = accept_socks(&proxy, 0x00);
        stream.write_all(b"554 go away\r\n").unwrap();
        // The tunnel is closed without the greeting being sent.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client
        .write_all(b"EHLO mybox.onion target.example.com\r\n")
        .unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_REJECTED));

    upstream.join().unwrap();
    assert_eq!(session.join().unwrap().unwrap(), Outcome::UpstreamRejected);
}

#[test]
fn test_upstream_silent() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut options = options_for(&proxy);
    options.greeting_timeout = Duration::from_millis(200);
    let (mut client, session) = start_session(options);

    let upstream = thread::spawn(move || {
        let (mut stream, _, _) = accept_socks(&proxy, 0x00);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"EHLO a.example b.example\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_NO_CONNECT));

    upstream.join().unwrap();
    assert_eq!(session.join().unwrap().unwrap(), Outcome::UpstreamSilent);
}

#[test]
fn test_proxy_refuses_connect() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let (mut client, session) = start_session(options_for(&proxy));

    let upstream = thread::spawn(move || {
        let (mut stream, _, _) = accept_socks(&proxy, 0x05);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"EHLO a.example b.example\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_NO_CONNECT));

    upstream.join().unwrap();
    let outcome = session.join().unwrap().unwrap();
    assert_eq!(outcome, Outcome::DialFailed);
    assert!(outcome.is_failure());
}

#[test]
fn test_proxy_unreachable() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let options = SessionOptions {
        proxy_host: "127.0.0.1".to_string(),
        proxy_port: port,
        negotiation_timeout: Duration::from_secs(2),
        ..SessionOptions::default()
    };
    let (mut client, session) = start_session(options);

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"HELO a.example b.example\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_NO_CONNECT));
    assert_eq!(session.join().unwrap().unwrap(), Outcome::DialFailed);
}

#[test]
fn test_quit_before_helo() {
    let (mut client, session) = start_session(SessionOptions::default());

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"quit\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_CLOSING));
    assert_eq!(session.join().unwrap().unwrap(), Outcome::Quit);
}

#[test]
fn test_invalid_commands_then_quit() {
    let (mut client, session) = start_session(SessionOptions::default());

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"NOOP\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));
    client.write_all(b"\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));
    client.write_all(b"EHLO\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));
    client.write_all(b"QUIT\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_CLOSING));
    assert_eq!(session.join().unwrap().unwrap(), Outcome::Quit);
}

#[test]
fn test_malformed_helo_is_invalid() {
    let (mut client, session) = start_session(SessionOptions::default());

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.write_all(b"HELO onlyone\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));
    client.write_all(b"EHLO a b c\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));
    client.write_all(b"QUIT\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_CLOSING));
    assert_eq!(session.join().unwrap().unwrap(), Outcome::Quit);
}

#[test]
fn test_overlong_command_line() {
    let (mut client, session) = start_session(SessionOptions::default());

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    let mut line = vec![b'x'; 300];
    line.extend_from_slice(b"\r\n");
    client.write_all(&line).unwrap();

    // The first 255 bytes overflow the line; the remainder is its own line.
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));
    assert_eq!(read_line(&mut client), reply(REPLY_INVALID));

    client.write_all(b"QUIT\r\n").unwrap();
    assert_eq!(read_line(&mut client), reply(REPLY_CLOSING));
    assert_eq!(session.join().unwrap().unwrap(), Outcome::Quit);
}

#[test]
fn test_command_timeout() {
    let options = SessionOptions {
        command_timeout: Duration::from_millis(200),
        ..SessionOptions::default()
    };
    let (mut client, session) = start_session(options);

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    assert_eq!(read_line(&mut client), reply(REPLY_TIMED_OUT));
    let outcome = session.join().unwrap().unwrap();
    assert_eq!(outcome, Outcome::CommandTimeout);
    assert!(!outcome.is_failure());
}

#[test]
fn test_client_closes_before_command() {
    let (mut client, session) = start_session(SessionOptions::default());

    assert_eq!(read_line(&mut client), reply(REPLY_WELCOME));
    client.shutdown(Shutdown::Write).unwrap();
    assert_eq!(session.join().unwrap().unwrap(), Outcome::ClientClosed);
}
