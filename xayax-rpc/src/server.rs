//! The HTTP server hosting the RPC methods.

use std::net::SocketAddr;

use jsonrpc_core::IoHandler;
use jsonrpc_http_server::{CloseHandle, Server, ServerBuilder};
use tracing::info;

use crate::{Rpc, RpcImpl};

/// Number of HTTP worker threads serving RPC requests.
const RPC_THREADS: usize = 4;

/// Configuration for the RPC server.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Port the server listens on.
    pub port: u16,

    /// Whether to bind on localhost only instead of all interfaces.
    pub listen_locally: bool,
}

impl Config {
    /// The socket address to bind to.
    pub fn listen_addr(&self) -> SocketAddr {
        if self.listen_locally {
            ([127, 0, 0, 1], self.port).into()
        } else {
            ([0, 0, 0, 0], self.port).into()
        }
    }
}

/// A running RPC server.
pub struct RpcServer {
    server: Server,
}

impl RpcServer {
    /// Starts serving the given methods per the configuration.
    pub fn start(rpc: RpcImpl, config: &Config) -> std::io::Result<Self> {
        let mut io = IoHandler::new();
        io.extend_with(rpc.to_delegate());

        let addr = config.listen_addr();
        let server = ServerBuilder::new(io)
            .threads(RPC_THREADS)
            .start_http(&addr)?;
        info!(%addr, "opened RPC endpoint");

        Ok(Self { server })
    }

    /// Returns a handle that can close the server from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        self.server.close_handle()
    }

    /// Shuts the server down, dropping in-flight connections gracefully.
    pub fn close(self) {
        self.server.close();
    }
}
