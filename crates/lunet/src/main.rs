use bytes::Bytes;
use log::{Level, error, info};
use lunet_log::LunetLogger;
use lunet_raknet::{Server, ServerEvent};

mod config;

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("server error: {0}")]
    RakNet(#[from] lunet_raknet::RakNetError),
}

type Result<T> = std::result::Result<T, AppError>;

/// The reliability layer assumes a single cooperative task, so the runtime
/// is pinned to one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    LunetLogger::init(Level::Info).expect("logger already installed");

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let password = Bytes::from(config.server.password.clone().into_bytes());

    let (mut server, socket, mut events) = Server::bind(
        config.listen_addr(),
        config.server.max_connections as usize,
        password,
    )
    .await?;
    info!("lunet server started on {}", server.local_addr());

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::NewConnection(addr) => info!("connected: {addr}"),
                ServerEvent::Disconnect(addr) => info!("disconnected: {addr}"),
                ServerEvent::UserPacket { address, data } => {
                    info!("user packet from {address}: {} bytes", data.len());
                }
            }
        }
    });

    server.run(socket).await?;
    Ok(())
}
