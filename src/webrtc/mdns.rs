use webrtc::ice::mdns::MulticastDnsMode;

const MDNS_MODE_ENV: &str = "FEED_RELAY_WEBRTC_MDNS_MODE";

fn parse_mdns_mode(raw: &str) -> Option<MulticastDnsMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "disabled" | "off" | "false" | "0" => Some(MulticastDnsMode::Disabled),
        "query" | "query_only" | "query-only" => Some(MulticastDnsMode::QueryOnly),
        "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
            Some(MulticastDnsMode::QueryAndGather)
        }
        _ => None,
    }
}

pub fn mdns_mode_from_env() -> Option<MulticastDnsMode> {
    parse_mdns_mode(&std::env::var(MDNS_MODE_ENV).ok()?)
}

/// mDNS mode for new peer connections, `QueryOnly` unless overridden
pub fn mdns_mode() -> MulticastDnsMode {
    mdns_mode_from_env().unwrap_or(MulticastDnsMode::QueryOnly)
}

pub fn mdns_host_name(session_id: &str) -> String {
    format!("{session_id}.local")
}
