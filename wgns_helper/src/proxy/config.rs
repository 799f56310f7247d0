//! VLESS inbound document consumed by the proxy binary.

use serde::Serialize;

/// Optional HTTP request camouflage on the TCP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub host: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ProxyDocument {
    log: LogSection,
    inbounds: Vec<Inbound>,
    outbounds: Vec<Outbound>,
}

#[derive(Debug, Serialize)]
struct LogSection {
    loglevel: &'static str,
}

#[derive(Debug, Serialize)]
struct Inbound {
    listen: &'static str,
    port: u16,
    protocol: &'static str,
    settings: VlessSettings,
    #[serde(rename = "streamSettings")]
    stream_settings: StreamSettings,
}

#[derive(Debug, Serialize)]
struct VlessSettings {
    clients: Vec<Client>,
    decryption: &'static str,
}

#[derive(Debug, Serialize)]
struct Client {
    id: String,
    flow: &'static str,
}

#[derive(Debug, Serialize)]
struct StreamSettings {
    network: &'static str,
    security: &'static str,
    #[serde(rename = "tcpSettings", skip_serializing_if = "Option::is_none")]
    tcp_settings: Option<TcpSettings>,
}

#[derive(Debug, Serialize)]
struct TcpSettings {
    header: TcpHeader,
}

#[derive(Debug, Serialize)]
struct TcpHeader {
    #[serde(rename = "type")]
    kind: &'static str,
    request: HttpRequest,
}

#[derive(Debug, Serialize)]
struct HttpRequest {
    version: &'static str,
    method: &'static str,
    path: Vec<String>,
    headers: RequestHeaders,
}

#[derive(Debug, Serialize)]
struct RequestHeaders {
    #[serde(rename = "Host")]
    host: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Outbound {
    protocol: &'static str,
    tag: &'static str,
}

impl ProxyDocument {
    /// One inbound on `port` accepting exactly `ids`, plus a direct egress.
    pub fn vless(port: u16, ids: &[String], header: Option<&HttpHeader>) -> Self {
        let tcp_settings = header.map(|h| TcpSettings {
            header: TcpHeader {
                kind: "http",
                request: HttpRequest {
                    version: "1.1",
                    method: "GET",
                    path: vec![h.path.clone()],
                    headers: RequestHeaders {
                        host: vec![h.host.clone()],
                    },
                },
            },
        });

        Self {
            log: LogSection {
                loglevel: "warning",
            },
            inbounds: vec![Inbound {
                listen: "0.0.0.0",
                port,
                protocol: "vless",
                settings: VlessSettings {
                    clients: ids
                        .iter()
                        .map(|id| Client {
                            id: id.clone(),
                            flow: "",
                        })
                        .collect(),
                    decryption: "none",
                },
                stream_settings: StreamSettings {
                    network: "tcp",
                    security: "none",
                    tcp_settings,
                },
            }],
            outbounds: vec![Outbound {
                protocol: "freedom",
                tag: "direct",
            }],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}
