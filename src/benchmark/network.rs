//! iperf3 throughput against a user-supplied server, with ping as the
//! latency fallback.

use std::process::Command;
use std::time::Duration;
use tracing::info;

use super::parse::{parse_iperf3, parse_ping_avg};
use super::{measure, or_zero, NetworkBenchmark};
use crate::config::NetworkTarget;
use crate::context::RunContext;
use crate::deps::ensure_optional_tool;

const IPERF_SECS: u64 = 10;
const PING_COUNT: u32 = 5;

pub fn iperf_args(target: &NetworkTarget) -> Vec<String> {
    vec![
        "-c".to_string(),
        target.host.clone(),
        "-p".to_string(),
        target.port.to_string(),
        "-t".to_string(),
        IPERF_SECS.to_string(),
        "-J".to_string(),
    ]
}

pub fn run(ctx: &mut RunContext) -> NetworkBenchmark {
    let Some(target) = ctx.config.network_target.clone() else {
        info!("no network target configured; network benchmark skipped");
        return NetworkBenchmark::default();
    };
    let mut result = NetworkBenchmark {
        target: Some(target.to_string()),
        ..Default::default()
    };

    if !ensure_optional_tool(ctx, "iperf3") {
        ctx.degrade("Network benchmark", "iperf3 is not available");
        return result;
    }

    ctx.console
        .step(&format!("Network: iperf3 to {target} ({IPERF_SECS}s)"));
    let mut cmd = Command::new("iperf3");
    cmd.args(iperf_args(&target));
    let iperf = measure(ctx, "iperf3", &mut cmd, Duration::from_secs(IPERF_SECS), parse_iperf3);
    let iperf = or_zero(ctx, "Network bandwidth", iperf);
    result.bandwidth_mbps = iperf.bandwidth_mbps;

    if let Some(rtt) = iperf.rtt_ms {
        result.latency_ms = rtt;
        result.latency_source = Some("iperf3".to_string());
    } else {
        let mut cmd = Command::new("ping");
        cmd.args(["-c", &PING_COUNT.to_string(), &target.host]);
        let ping = measure(
            ctx,
            "ping",
            &mut cmd,
            Duration::from_secs(u64::from(PING_COUNT) * 2),
            parse_ping_avg,
        );
        result.latency_ms = or_zero(ctx, "Network latency", ping);
        if result.latency_ms > 0.0 {
            result.latency_source = Some("ping".to_string());
        }
    }

    info!(
        target = %target,
        bandwidth_mbps = result.bandwidth_mbps,
        latency_ms = result.latency_ms,
        "network benchmark finished"
    );
    if result.bandwidth_mbps > 0.0 {
        ctx.console.success(&format!(
            "Network: {:.0} Mbps, {:.3} ms",
            result.bandwidth_mbps, result.latency_ms
        ));
    }
    result
}
