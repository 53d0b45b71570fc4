//! Reverse DNS and Team Cymru ASN lookups over hickory.

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

use super::{AsnLabel, Resolution, Resolve, sanitize_display};

pub struct DnsResolver {
    resolver: TokioResolver,
    reverse: bool,
    asn: bool,
}

impl DnsResolver {
    /// System resolver configuration, falling back to Google DNS
    pub fn new(reverse: bool, asn: bool) -> Self {
        let resolver = match Resolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                warn!(error = %e, "system DNS config unavailable, using 8.8.8.8");
                Resolver::builder_with_config(ResolverConfig::google(), TokioConnectionProvider::default())
                    .build()
            }
        };
        Self { resolver, reverse, asn }
    }

    async fn reverse(&self, addr: IpAddr) -> Option<String> {
        let lookup = self.resolver.reverse_lookup(addr).await.ok()?;
        let name = lookup.iter().next()?.to_string();
        Some(sanitize_display(name.trim_end_matches('.')))
    }

    async fn origin(&self, addr: IpAddr) -> Option<AsnLabel> {
        let origin = self.txt(&origin_query(addr)).await?;
        let (number, prefix) = parse_origin(&origin)?;
        let name = match self.txt(&format!("AS{number}.asn.cymru.com")).await {
            Some(txt) => parse_as_name(&txt),
            None => None,
        };
        Some(AsnLabel {
            number,
            name: name.unwrap_or_else(|| format!("AS{number}")),
            prefix,
        })
    }

    /// First TXT record, with split strings joined and quotes stripped
    async fn txt(&self, name: &str) -> Option<String> {
        let records = self.resolver.txt_lookup(name).await.ok()?;
        let txt = records.iter().next()?;
        let joined: String = txt
            .txt_data()
            .iter()
            .filter_map(|bytes| std::str::from_utf8(bytes).ok())
            .collect();
        Some(joined.trim_matches('"').to_string())
    }
}

impl Resolve for DnsResolver {
    async fn resolve(&self, addr: IpAddr) -> Resolution {
        let hostname = if self.reverse { self.reverse(addr).await } else { None };
        let asn = if self.asn { self.origin(addr).await } else { None };
        if hostname.is_none() && asn.is_none() {
            Resolution::Unresolved
        } else {
            Resolution::Resolved { hostname, asn }
        }
    }
}

/// Query name for the origin TXT record: reversed octets or nibbles
fn origin_query(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => ipv4_origin_query(v4),
        IpAddr::V6(v6) => ipv6_origin_query(v6),
    }
}

fn ipv4_origin_query(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.origin.asn.cymru.com", o[3], o[2], o[1], o[0])
}

fn ipv6_origin_query(ip: Ipv6Addr) -> String {
    let nibbles: Vec<String> = ip
        .octets()
        .iter()
        .rev()
        .flat_map(|byte| [byte & 0x0F, byte >> 4])
        .map(|n| format!("{n:x}"))
        .collect();
    format!("{}.origin6.asn.cymru.com", nibbles.join("."))
}

/// "15169 | 8.8.8.0/24 | US | arin | 1992-12-01" → (15169, prefix)
fn parse_origin(txt: &str) -> Option<(u32, Option<String>)> {
    let mut parts = txt.split('|').map(str::trim);
    // Multi-origin prefixes list several ASNs separated by spaces; take the first
    let number = parts.next()?.trim_start_matches("AS").split_whitespace().next()?.parse().ok()?;
    let prefix = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
    Some((number, prefix))
}

/// "15169 | US | arin | 2000-03-30 | GOOGLE, US" → name
fn parse_as_name(txt: &str) -> Option<String> {
    txt.split('|').map(str::trim).nth(4).map(sanitize_display)
}
