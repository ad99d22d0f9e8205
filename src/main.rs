//! Echo server on the coroutine runtime.
//!
//! Usage: `coroio [ADDR] [CONFIG.toml]`, ADDR defaults to `127.0.0.1:8020`.

use std::net::SocketAddr;
use std::process::ExitCode;

use coroio::net::{Socket, TcpServer};
use coroio::{Config, IoManager};

fn echo(client: Socket) {
    let peer = client.peer_addr().ok();
    tracing::info!("client {:?} connected", peer);
    let mut buf = vec![0u8; 4096];
    loop {
        match client.recv(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = client.send_all(&buf[..n]) {
                    tracing::warn!("send to {:?} failed: {}", peer, e);
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("recv from {:?} failed: {}", peer, e);
                break;
            }
        }
    }
    tracing::info!("client {:?} closed", peer);
}

fn main() -> ExitCode {
    coroio::logging::init();
    coroio::register_config_vars();

    let mut args = std::env::args().skip(1);
    let addr: SocketAddr = match args.next().unwrap_or_else(|| "127.0.0.1:8020".into()).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("invalid address: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = args.next() {
        if let Err(e) = Config::load_from_file(&path) {
            tracing::error!("loading {} failed: {}", path, e);
            return ExitCode::FAILURE;
        }
    }

    let iom = match IoManager::new(2, true, "echo") {
        Ok(iom) => iom,
        Err(e) => {
            tracing::error!("IoManager::new failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let server = TcpServer::new(iom.handle(), iom.handle(), echo);
    server.set_name("coroio-echo");
    if let Err(e) = server.bind(addr) {
        tracing::error!("bind {} failed: {}", addr, e);
        return ExitCode::FAILURE;
    }
    server.start();
    tracing::info!("echo server listening on {:?}", server.local_addrs());

    // With use_caller the main thread joins the workers here and only returns
    // once nothing is left to run.
    iom.stop();
    ExitCode::SUCCESS
}
