//! FIX acceptor example.
//!
//! Accepts any number of initiators, answers Logon with Logon and every
//! NewOrderSingle with a filled ExecutionReport. A client sending garbage is
//! dropped on its own; the others keep trading.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use ironsim::prelude::*;
use ironsim::service::fix::tags;
use tracing::{info, warn};

mod common;
use common::{ExampleConfig, init_logging};

const SEND_TIMEOUT_MS: u64 = 1_000;

struct Acceptor;

impl MessageHandler<FixProtocol> for Acceptor {
    fn on_message(
        &self,
        session: &Arc<Session<FixProtocol>>,
        message: FixMessage,
    ) -> Result<(), ironsim::core::ProtocolError> {
        info!(session = %session.name(), msg_type = ?message.msg_type(), "received");
        let response = match message.msg_type() {
            Some("A") => Some(FixMessage::new("A").with_field(98, "0").with_field(108, "30")),
            Some("1") => Some(
                FixMessage::new("0").with_field(112, message.field(112).unwrap_or_default()),
            ),
            Some("D") => Some(
                FixMessage::new("8")
                    .with_field(11, message.field(11).unwrap_or("0"))
                    .with_field(55, message.field(55).unwrap_or("N/A"))
                    .with_field(54, message.field(54).unwrap_or("1"))
                    .with_field(38, message.field(38).unwrap_or("0"))
                    .with_field(39, "2")
                    .with_field(150, "F")
                    .with_field(tags::TEXT, "filled"),
            ),
            Some("5") => Some(FixMessage::new("5")),
            _ => None,
        };
        if let Some(response) = response
            && let Err(err) = session.send(response, SEND_TIMEOUT_MS)
        {
            warn!(session = %session.name(), error = %err, "reply failed");
        }
        Ok(())
    }

    fn on_session_opened(&self, session: &Arc<Session<FixProtocol>>) {
        info!(session = %session.name(), "initiator connected");
    }

    fn on_session_closed(&self, session: &Arc<Session<FixProtocol>>) {
        info!(session = %session.name(), "initiator disconnected");
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cfg = ExampleConfig::acceptor();
    info!("Starting FIX acceptor on {}", cfg.addr());

    let settings = ServerSettings::new(cfg.host.clone(), cfg.port).with_common(
        CommonSettings::default()
            .with_dictionary("FIX44")
            .with_heartbeat_interval_ms(cfg.heartbeat_interval * 1_000),
    );
    let server = ServerService::server(FixProtocol::new(
        cfg.sender_comp_id.clone(),
        cfg.target_comp_id.clone(),
    ));
    server.init(
        ServiceContext::with_defaults().context("building service context")?,
        Arc::new(LoggingMonitor),
        Arc::new(Acceptor),
        Arc::new(settings),
        ServiceName::from("acceptor"),
    );
    server.start();
    if server.status() != ServiceStatus::Started {
        server.dispose();
        bail!("acceptor did not start: {}", server.status());
    }
    info!("Listening on {:?}", server.local_addr());

    let started = Instant::now();
    while cfg.run_for.is_none_or(|limit| started.elapsed() < limit) {
        std::thread::sleep(Duration::from_secs(5));
        info!(
            status = %server.status(),
            sessions = server.active_sessions().len(),
            "acceptor running"
        );
    }

    server.dispose();
    info!("Acceptor stopped: {}", server.status());
    Ok(())
}
