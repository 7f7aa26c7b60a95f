use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use udpt::{Config, ItemHandler, Receiver};

/// Key used when UDPT_KEY is not set. Fine for a localhost demo only.
const DEMO_KEY: &str = "aA2Xh41FiC4Wtj3e5b2LbytMdn6on7P0";

/// Keeps the last item received and logs it.
#[derive(Default)]
struct DemoStore {
    last: Mutex<Option<(String, Vec<u8>)>>,
}

impl ItemHandler for DemoStore {
    fn item_completed(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        info!(
            "received {} ({} bytes): {}",
            name,
            data.len(),
            String::from_utf8_lossy(data)
        );
        let mut last = self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("demo store lock poisoned"))?;
        *last = Some((name.to_owned(), data.to_vec()));
        Ok(())
    }

    fn provide_existing_data(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let last = self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("demo store lock poisoned"))?;
        Ok(last
            .as_ref()
            .filter(|(n, _)| n == name)
            .map(|(_, data)| data.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let mut config = Config::from_env();
    if std::env::var("UDPT_CHUNK_SIZE").is_err() {
        // Small chunks so the demo item spans several packets.
        config.chunk_size = 5;
    }

    let default_filter = if config.verbose_logging {
        "udpt=debug,udpt_demo=debug"
    } else {
        "udpt=info,udpt_demo=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let key = std::env::var("UDPT_KEY").unwrap_or_else(|_| {
        warn!("UDPT_KEY not set, using the built-in demo key");
        DEMO_KEY.into()
    });
    let host = std::env::var("UDPT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("UDPT_PORT")
        .unwrap_or_else(|_| "1234".into())
        .parse()?;
    let name = std::env::var("UDPT_DEMO_NAME").unwrap_or_else(|_| "demo_data".into());
    let payload = std::env::var("UDPT_DEMO_PAYLOAD").unwrap_or_else(|_| "Hello World!".into());

    let bind_addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let store = Arc::new(DemoStore::default());
    let receiver = Receiver::bind(bind_addr, key.as_bytes(), config.clone(), store.clone())?.spawn()?;
    info!("receiver listening on {}", receiver.local_addr());

    let result = udpt::send(&name, payload, &host, port, key.as_bytes(), config).await;

    match &result {
        Ok(report) => info!(
            "confirmed {} in {} packets, {} retransmits, {} ms, sha256={}",
            report.name,
            report.packets,
            report.retransmits,
            report.elapsed.as_millis(),
            hex::encode(report.hash)
        ),
        Err(e) => warn!("transfer failed: {}", e),
    }

    let stats = receiver.stats();
    info!(
        "receiver: {} datagrams, {} items, {} integrity drops",
        stats.datagrams, stats.items_completed, stats.integrity_drops
    );
    receiver.shutdown().await?;

    result?;
    Ok(())
}
