//! Startup ordering and teardown wiring.
//!
//! Each subsystem's teardown is pushed onto the stack before the next
//! subsystem starts, so a failure partway through unwinds exactly what came
//! up. A reload builds a whole new stack and tears down the old one only
//! once the new one is serving.

use anyhow::bail;

use broker_shared::config::{Config, InboundProxyConfig, OutboundProxyConfig};
use broker_shared::teardown::TeardownStack;

use crate::metrics::Metrics;
use crate::{heartbeat, inbound, relay_server, wireguard};

pub fn user_agent() -> String {
    format!("semgrep-network-broker/{}", env!("CARGO_PKG_VERSION"))
}

/// Bring up everything the config asks for: tunnel, heartbeat, inbound
/// proxy, then the relay. On failure the partially built stack is torn
/// down before returning.
pub async fn start_broker(
    config: &Config,
    broker_index_override: Option<usize>,
) -> anyhow::Result<TeardownStack> {
    if config.inbound.is_none() && config.outbound.is_none() {
        bail!("need inbound and/or outbound config");
    }

    let stack = TeardownStack::new();

    if let Some(inbound_config) = &config.inbound {
        if let Err(e) = start_inbound(inbound_config, broker_index_override, &stack).await {
            stack.teardown().await;
            return Err(e);
        }
    }

    if let Some(outbound_config) = &config.outbound {
        if let Err(e) = start_outbound(outbound_config, &stack).await {
            stack.teardown().await;
            return Err(e);
        }
    }

    Ok(stack)
}

async fn start_inbound(
    config: &InboundProxyConfig,
    broker_index_override: Option<usize>,
    stack: &TeardownStack,
) -> anyhow::Result<()> {
    let replica_index = config.wireguard.resolve_replica_index(broker_index_override)?;
    config.validate(replica_index)?;

    let (net, netstack_handle) = wireguard::start(&config.wireguard, replica_index).await?;
    stack.push("wireguard", Box::new(move || Box::pin(netstack_handle.shutdown())));

    let metrics = Metrics::new();

    let heartbeat = heartbeat::start(
        &config.heartbeat,
        net.clone(),
        user_agent(),
        metrics.clone(),
    )
    .await?;
    stack.push(
        "heartbeat",
        Box::new(move || {
            Box::pin(async move {
                heartbeat.stop().await;
                Ok(())
            })
        }),
    );

    let server = inbound::start(config, &net, metrics).await?;
    stack.push("inbound-proxy", Box::new(move || Box::pin(server.stop())));

    Ok(())
}

async fn start_outbound(config: &OutboundProxyConfig, stack: &TeardownStack) -> anyhow::Result<()> {
    let metrics = Metrics::new();
    if let Some(server) = relay_server::start(config, metrics).await? {
        stack.push("relay", Box::new(move || Box::pin(server.stop())));
    }
    Ok(())
}
