//! FIX initiator example.
//!
//! Connects to the acceptor, logs on, sends a few orders, logs out and
//! disposes the service.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use ironsim::prelude::*;
use ironsim::service::fix::tags;
use tracing::info;

mod common;
use common::{ExampleConfig, init_logging};

const SEND_TIMEOUT_MS: u64 = 1_000;
const ORDERS: usize = 3;

#[derive(Default)]
struct Initiator {
    fills: AtomicUsize,
}

impl MessageHandler<FixProtocol> for Initiator {
    fn on_message(
        &self,
        session: &Arc<Session<FixProtocol>>,
        message: FixMessage,
    ) -> Result<(), ironsim::core::ProtocolError> {
        match message.msg_type() {
            Some("8") => {
                self.fills.fetch_add(1, Ordering::SeqCst);
                info!(
                    session = %session.name(),
                    order = message.field(11).unwrap_or("?"),
                    text = message.field(tags::TEXT).unwrap_or(""),
                    "execution report"
                );
            }
            other => info!(session = %session.name(), msg_type = ?other, "received"),
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cfg = ExampleConfig::initiator();
    info!("Connecting FIX initiator to {}", cfg.addr());

    let settings = ClientSettings::new(cfg.host.clone(), cfg.port).with_common(
        CommonSettings::default()
            .with_dictionary("FIX44")
            .with_heartbeat_interval_ms(cfg.heartbeat_interval * 1_000),
    );
    let handler = Arc::new(Initiator::default());
    let client = ClientService::client(FixProtocol::new(
        cfg.sender_comp_id.clone(),
        cfg.target_comp_id.clone(),
    ));
    client.init(
        ServiceContext::with_defaults().context("building service context")?,
        Arc::new(LoggingMonitor),
        handler.clone(),
        Arc::new(settings),
        ServiceName::from("initiator"),
    );
    client.start();
    if client.status() != ServiceStatus::Started {
        client.dispose();
        bail!("initiator did not start: {}", client.status());
    }
    let session = client.session().context("connected client has a session")?;

    let logon = FixMessage::new("A")
        .with_field(98, "0")
        .with_field(108, cfg.heartbeat_interval.to_string());
    session
        .send(logon, SEND_TIMEOUT_MS)
        .context("sending logon")?;
    for i in 1..=ORDERS {
        let order = FixMessage::new("D")
            .with_field(11, format!("ORD-{i}"))
            .with_field(55, "AAPL")
            .with_field(54, "1")
            .with_field(38, (100 * i).to_string())
            .with_field(40, "1");
        session.send(order, SEND_TIMEOUT_MS).context("sending order")?;
    }

    let deadline = Instant::now() + cfg.run_for.unwrap_or(Duration::from_secs(5));
    while handler.fills.load(Ordering::SeqCst) < ORDERS && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    info!(fills = handler.fills.load(Ordering::SeqCst), "orders done");

    session
        .send(FixMessage::new("5"), SEND_TIMEOUT_MS)
        .context("sending logout")?;
    client.dispose();
    info!("Initiator stopped: {}", client.status());
    Ok(())
}
