//! AMQP ingestion: consumes uplink packets from the broker and feeds them
//! to the hub.
//!
//! The hub never sees malformed input; deliveries that fail to decode are
//! logged and dropped here. Broker failures do not take the process down —
//! the consumer reconnects after a fixed delay.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use log::{error, info, warn};

use crate::hub::HubHandle;
use crate::message::UplinkMessage;
use crate::settings::Settings;

/// How many unacknowledged deliveries the broker may push at once.
const PREFETCH_COUNT: u16 = 10;

/// Delay between reconnect attempts after a broker failure.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Run the consumer until the process exits, reconnecting on failure.
pub async fn run(settings: Settings, hub: HubHandle) {
    loop {
        if let Err(err) = consume(&settings, &hub).await {
            error!("amqp consumer failed: {err:#}");
        }
        info!("reconnecting to amqp broker in {RECONNECT_DELAY_SECS}s");
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn consume(settings: &Settings, hub: &HubHandle) -> Result<()> {
    let conn = Connection::connect(&settings.amqp_uri(), ConnectionProperties::default())
        .await
        .context("connecting to amqp broker")?;
    let channel = conn.create_channel().await.context("opening channel")?;

    channel
        .exchange_declare(
            &settings.amqp_exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("declaring exchange")?;

    let queue = channel
        .queue_declare(
            &settings.amqp_queue,
            QueueDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("declaring queue")?;

    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
        .await
        .context("setting channel qos")?;

    channel
        .queue_bind(
            queue.name().as_str(),
            &settings.amqp_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("binding queue")?;

    let mut consumer = channel
        .basic_consume(
            queue.name().as_str(),
            "",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("starting consumer")?;

    info!("waiting for uplink packets on queue {}", queue.name());

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.context("receiving delivery")?;
        match serde_json::from_slice::<UplinkMessage>(&delivery.data) {
            Ok(message) => hub.publish(message).await,
            Err(err) => warn!("dropping malformed uplink packet: {err}"),
        }
    }

    Err(anyhow::anyhow!("amqp consumer stream ended"))
}
