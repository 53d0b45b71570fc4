use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;

use crate::config::SessionConfig;
use crate::lookup::{LabelCache, Resolution};
use crate::state::Snapshot;

#[derive(Serialize)]
struct JsonExport<'a> {
    config: &'a SessionConfig,
    snapshot: &'a Snapshot,
    labels: BTreeMap<IpAddr, Resolution>,
}

/// Write the session config, final snapshot and resolved labels as pretty JSON
pub fn export_json<W: Write>(
    config: &SessionConfig,
    snapshot: &Snapshot,
    labels: &LabelCache,
    writer: W,
) -> serde_json::Result<()> {
    let labels = snapshot
        .addresses()
        .map(|addr| (addr, labels.get(addr)))
        .collect();
    let export = JsonExport {
        config,
        snapshot,
        labels,
    };
    serde_json::to_writer_pretty(writer, &export)
}
