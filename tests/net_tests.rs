use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use coroio::net::{Socket, TcpServer};
use coroio::{IoManager, Task};

fn echo(client: Socket) {
    let mut buf = [0u8; 1024];
    loop {
        match client.recv(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if client.send_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
}

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn server_echoes_to_blocking_clients() {
    let iom = IoManager::new(2, false, "net_echo").unwrap();
    let server = TcpServer::new(iom.handle(), iom.handle(), echo);
    server.bind(local()).unwrap();
    let addr = server.local_addrs()[0];
    assert!(server.start());
    assert!(!server.start());

    for i in 0..3 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let msg = format!("hello {}", i);
        stream.write_all(msg.as_bytes()).unwrap();
        let mut back = vec![0u8; msg.len()];
        stream.read_exact(&mut back).unwrap();
        assert_eq!(back, msg.as_bytes());
    }

    server.stop();
    assert!(server.is_stopped());
    // Wait for the listeners to be closed on the accept worker.
    for _ in 0..500 {
        if server.local_addrs().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(server.local_addrs().is_empty());
}

#[test]
fn coroutine_client_talks_to_server() {
    let iom = IoManager::new(1, false, "net_coroutine_client").unwrap();
    let server = TcpServer::new(iom.handle(), iom.handle(), echo);
    server.bind(local()).unwrap();
    let addr = server.local_addrs()[0];
    server.start();

    let (tx, rx) = mpsc::channel();
    iom.schedule(Task::callback(move || {
        let result = Socket::tcp(&addr).and_then(|sock| {
            sock.connect(&addr, Some(1000))?;
            assert_eq!(sock.peer_addr()?, addr);
            sock.send_all(b"ping")?;
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < buf.len() {
                match sock.recv(&mut buf[got..])? {
                    0 => break,
                    n => got += n,
                }
            }
            Ok(buf[..got].to_vec())
        });
        let _ = tx.send(result);
    }));

    let reply = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(reply, b"ping");
    server.stop();
}

#[test]
fn accepted_clients_get_read_timeout() {
    let iom = IoManager::new(1, false, "net_read_timeout").unwrap();
    let timeouts = Arc::new(AtomicUsize::new(0));
    let t = timeouts.clone();
    let server = TcpServer::new(iom.handle(), iom.handle(), move |client: Socket| {
        let mut buf = [0u8; 8];
        if let Err(e) = client.recv(&mut buf) {
            if e.raw_os_error() == Some(libc::ETIMEDOUT) {
                t.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    server.set_read_timeout(100);
    server.bind(local()).unwrap();
    let addr = server.local_addrs()[0];
    server.start();

    let _silent = TcpStream::connect(addr).unwrap();
    for _ in 0..500 {
        if timeouts.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    server.stop();
}
