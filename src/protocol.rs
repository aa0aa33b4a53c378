//! # Wire protocol between manager and workers.
//!
//! Control traffic is line-oriented text. This module parses every inbound
//! verb into a typed [`WorkerMessage`] and provides the URL-style escaping
//! used for remote file names and feature names. Lines that match no verb
//! are handed back to the caller unparsed: in the main dispatch loop that is
//! a protocol violation, while inside an explicit exchange (such as a
//! `send_results` drain) those are the expected data lines.

/// Protocol version spoken by this manager.
pub const PROTOCOL_VERSION: i64 = 10;

/// Version string advertised to workers and the catalog.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Keepalive response; consumed silently.
    Alive,
    /// The handshake that promotes a connection to a worker.
    Handshake {
        protocol: i64,
        hostname: String,
        os: String,
        arch: String,
        version: String,
    },
    /// A named status query (`queue_status`, `task_status`, ...).
    StatusRequest(String),
    /// The worker has completed tasks ready for a `send_results` round.
    AvailableResults,
    /// One resource kind report.
    Resource {
        kind: String,
        total: i64,
        smallest: i64,
        largest: i64,
    },
    /// The short form `resource tag <n>`.
    ResourceTag(i64),
    /// A worker feature, URL-decoded.
    Feature(String),
    /// The worker attempted password auth.
    Auth,
    /// The worker asks for the manager's project name.
    NameQuery,
    /// A key/value metric or directive.
    Info { field: String, value: String },
    /// A cached file transfer succeeded remotely.
    CacheUpdate {
        cachename: String,
        size: i64,
        transfer_time: u64,
    },
    /// A cached file is gone; `length` bytes of error text follow.
    CacheInvalid { cachename: String, length: u64 },
    /// The worker serves peer transfers at this endpoint.
    TransferAddress { host: String, port: u16 },
    /// A task completion header; stdout bytes follow.
    TaskResult {
        status: i64,
        exit_code: i64,
        output_length: i64,
        execution_time: i64,
        taskid: u64,
    },
    /// A watched output file grew; `length` bytes follow.
    Update {
        taskid: u64,
        path: String,
        offset: u64,
        length: u64,
    },
    /// Terminator of a `send_results` sequence.
    End,
    /// A plain HTTP request on the worker port.
    HttpGet(String),
}

/// Parses one line; `None` means the line matched no protocol verb.
pub fn parse(line: &str) -> Option<WorkerMessage> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;

    match verb {
        "alive" => Some(WorkerMessage::Alive),
        "dataswarm" => {
            let protocol = words.next()?.parse().ok()?;
            let hostname = words.next()?.to_string();
            let os = words.next()?.to_string();
            let arch = words.next()?.to_string();
            let version = words.next()?.to_string();
            Some(WorkerMessage::Handshake {
                protocol,
                hostname,
                os,
                arch,
                version,
            })
        }
        "queue_status" | "task_status" | "worker_status" | "wable_status" | "resources_status" => {
            Some(WorkerMessage::StatusRequest(verb.to_string()))
        }
        "available_results" => Some(WorkerMessage::AvailableResults),
        "resource" => {
            let kind = words.next()?.to_string();
            let first: i64 = words.next()?.parse().ok()?;
            match (words.next(), kind.as_str()) {
                (None, "tag") => Some(WorkerMessage::ResourceTag(first)),
                (Some(smallest), _) => {
                    let smallest = smallest.parse().ok()?;
                    let largest = words.next()?.parse().ok()?;
                    Some(WorkerMessage::Resource {
                        kind,
                        total: first,
                        smallest,
                        largest,
                    })
                }
                _ => None,
            }
        }
        "feature" => Some(WorkerMessage::Feature(url_decode(words.next()?))),
        "auth" => Some(WorkerMessage::Auth),
        "name" => Some(WorkerMessage::NameQuery),
        "info" => {
            let field = words.next()?.to_string();
            let value = words.collect::<Vec<_>>().join(" ");
            Some(WorkerMessage::Info { field, value })
        }
        "cache-update" => {
            let cachename = words.next()?.to_string();
            let size = words.next()?.parse().ok()?;
            let transfer_time = words.next()?.parse().ok()?;
            Some(WorkerMessage::CacheUpdate {
                cachename,
                size,
                transfer_time,
            })
        }
        "cache-invalid" => {
            let cachename = words.next()?.to_string();
            let length = words.next()?.parse().ok()?;
            Some(WorkerMessage::CacheInvalid { cachename, length })
        }
        "transfer-address" => {
            let host = words.next()?.to_string();
            let port = words.next()?.parse().ok()?;
            Some(WorkerMessage::TransferAddress { host, port })
        }
        "result" => {
            let status = words.next()?.parse().ok()?;
            let exit_code = words.next()?.parse().ok()?;
            let output_length = words.next()?.parse().ok()?;
            let execution_time = words.next()?.parse().ok()?;
            let taskid = words.next()?.parse().ok()?;
            Some(WorkerMessage::TaskResult {
                status,
                exit_code,
                output_length,
                execution_time,
                taskid,
            })
        }
        "update" => {
            let taskid = words.next()?.parse().ok()?;
            let path = words.next()?.to_string();
            let offset = words.next()?.parse().ok()?;
            let length = words.next()?.parse().ok()?;
            Some(WorkerMessage::Update {
                taskid,
                path,
                offset,
                length,
            })
        }
        "end" => Some(WorkerMessage::End),
        "GET" => {
            let path = words.next()?.to_string();
            let http = words.next()?;
            if http.starts_with("HTTP/") {
                Some(WorkerMessage::HttpGet(path))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Escapes a file or feature name for transmission in a control line.
///
/// Alphanumerics and a small safe set pass through; everything else becomes
/// `%XX`.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'/' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Reverses [`url_encode`]. Malformed escapes are passed through verbatim.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(&h), Some(&l)) = (bytes.get(i + 1), bytes.get(i + 2)) {
                if let (Some(h), Some(l)) = ((h as char).to_digit(16), (l as char).to_digit(16)) {
                    out.push((h * 16 + l) as u8);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
