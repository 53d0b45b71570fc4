use std::io::Write;
use std::net::IpAddr;

use crate::config::SessionConfig;
use crate::lookup::LabelCache;
use crate::state::{HopRecord, Snapshot};

/// Generate a text report similar to mtr --report, one table per flow
pub fn generate_report<W: Write>(
    config: &SessionConfig,
    snapshot: &Snapshot,
    labels: &LabelCache,
    mut writer: W,
) -> std::io::Result<()> {
    writeln!(writer, "hoptrace report for {}", snapshot.target)?;
    writeln!(writer, "Started: {}", snapshot.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(
        writer,
        "Protocol: {:?}  Algorithm: {:?}  Flows: {}  Rounds: {}",
        config.protocol, config.algorithm, config.flows, snapshot.rounds_completed
    )?;

    for flow in &snapshot.flows {
        writeln!(writer)?;
        match flow.target_ttl {
            Some(ttl) => writeln!(writer, "Flow {} (target reached at hop {})", flow.flow, ttl)?,
            None => writeln!(writer, "Flow {} (target not reached)", flow.flow)?,
        }
        writeln!(
            writer,
            "{:>3}  {:<40} {:>6} {:>6} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
            "#", "Host", "Loss%", "Sent", "Avg", "Min", "Max", "StdDev", "Jitter", "Notes"
        )?;
        writeln!(writer, "{}", "-".repeat(120))?;

        for hop in &flow.hops {
            if hop.sent == 0 {
                continue;
            }
            writeln!(
                writer,
                "{:>3}  {:<40} {:>5.1}% {:>6} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
                hop.ttl,
                host_label(hop, labels),
                hop.loss_pct(),
                hop.sent,
                format_ms(hop.rtt.mean()),
                format_ms(hop.rtt.min),
                format_ms(hop.rtt.max),
                format_ms((hop.rtt.count > 1).then(|| hop.rtt.stddev())),
                format_ms((hop.rtt.count > 1).then(|| hop.rtt.jitter())),
                notes(hop)
            )?;
        }
    }

    let c = &snapshot.counters;
    writeln!(writer)?;
    writeln!(
        writer,
        "Probes: {} sent, {} answered, {} timed out, {} send failures, {} unmatched, {} undecodable",
        c.sent, c.answered, c.timed_out, c.send_failures, c.unmatched, c.decode_discarded
    )?;

    Ok(())
}

/// Generate report to string
pub fn generate_report_string(config: &SessionConfig, snapshot: &Snapshot, labels: &LabelCache) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = generate_report(config, snapshot, labels, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn host_label(hop: &HopRecord, labels: &LabelCache) -> String {
    let Some(addr) = hop.primary else {
        return if hop.received == 0 { "* * *".into() } else { "???".into() };
    };
    let label = labels.get(addr);
    let mut host = match label.hostname() {
        Some(name) => format!("{} ({})", name, addr),
        None => addr.to_string(),
    };
    if let Some(asn) = label.asn() {
        host = format!("[AS{}] {}", asn.number, host);
    }
    host
}

fn notes(hop: &HopRecord) -> String {
    let mut notes = Vec::new();
    let others: Vec<IpAddr> = hop.addresses().filter(|a| Some(*a) != hop.primary).collect();
    if !others.is_empty() {
        notes.push(format!("+{} paths", others.len()));
    }
    if hop.nat_detected {
        notes.push("NAT".to_string());
    }
    for label in &hop.mpls {
        notes.push(format!(
            "MPLS L={} E={} S={} T={}",
            label.label, label.exp, label.bottom as u8, label.ttl
        ));
    }
    notes.join(", ")
}

fn format_ms(d: Option<std::time::Duration>) -> String {
    match d {
        Some(d) => format!("{:.1}ms", d.as_secs_f64() * 1000.0),
        None => "-".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeProtocol;
    use crate::probe::{MplsLabel, ResponseKind};
    use crate::state::{Answer, HopEvent, HopTable, NatVerdict};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

    fn answer(ttl: u8, responder: IpAddr, rtt_ms: u64) -> HopEvent {
        HopEvent::Answered(Answer {
            flow: 0,
            ttl,
            round: 0,
            responder,
            rtt: Duration::from_millis(rtt_ms),
            kind: ResponseKind::TimeExceeded { code: 0 },
            nat: None,
            mpls: None,
        })
    }

    #[test]
    fn test_report_lists_hops_up_to_target() {
        let mut config = SessionConfig::new(TARGET, ProbeProtocol::Udp);
        config.max_ttl = 5;
        let table = HopTable::new(&config);
        let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        table.apply([
            HopEvent::Sent { flow: 0, ttl: 1 },
            HopEvent::Sent { flow: 0, ttl: 2 },
            HopEvent::Sent { flow: 0, ttl: 3 },
            answer(1, router, 2),
            HopEvent::TimedOut { flow: 0, ttl: 2, round: 0 },
            HopEvent::Answered(Answer {
                flow: 0,
                ttl: 3,
                round: 0,
                responder: TARGET,
                rtt: Duration::from_millis(9),
                kind: ResponseKind::DestinationUnreachable { code: 3 },
                nat: None,
                mpls: None,
            }),
        ]);

        let report = generate_report_string(&config, &table.snapshot(), &LabelCache::new());
        assert!(report.contains("hoptrace report for 192.0.2.1"));
        assert!(report.contains("target reached at hop 3"));
        assert!(report.contains("10.0.0.1"));
        assert!(report.contains("* * *"));
        assert!(report.contains("Probes: 3 sent, 2 answered, 1 timed out"));
    }

    #[test]
    fn test_notes_show_nat_and_mpls() {
        let mut hop = HopRecord::new(4);
        hop.record_sent();
        hop.record_answer(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)),
            Duration::from_millis(5),
            ResponseKind::TimeExceeded { code: 0 },
            0,
        );
        hop.mark_nat(NatVerdict::SourcePortRewritten {
            sent: 50000,
            seen: 61000,
        });
        hop.set_mpls(&[MplsLabel {
            label: 1042,
            exp: 0,
            bottom: true,
            ttl: 1,
        }]);

        assert_eq!(notes(&hop), "NAT, MPLS L=1042 E=0 S=1 T=1");
    }
}
