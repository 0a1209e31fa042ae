// Site, software and pinpad identity found in journal messages.
//
// Each field keeps the first value seen. Configuration settings and server
// hosts accumulate across the scanned entries.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::line::JournalEntry;

pub const DEFAULT_IDENTITY_SCAN: usize = 5000;

const MAX_SERVER_HOSTS: usize = 4;

/// Who produced a journal file and with what.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileIdentity {
    /// Hex SHA-256 of the raw object bytes.
    pub content_sha256: String,
    pub company_id: Option<String>,
    pub store_id: Option<String>,
    pub mid: Option<String>,
    pub mtx_pos_version: Option<String>,
    pub mtx_eps_version: Option<String>,
    pub seccode_version: Option<String>,
    pub pos_version: Option<String>,
    pub pinpad_model: Option<String>,
    pub pinpad_serial: Option<String>,
    pub pinpad_firmware: Option<String>,
    pub pinpad_os: Option<String>,
    pub pinpad_kernel: Option<String>,
    pub ip_address: Option<String>,
    pub server_hosts: Vec<String>,
    pub config: BTreeMap<String, String>,
}

impl FileIdentity {
    /// Flattened `(key, value)` pairs for file-level metadata, fields that
    /// were not found are left out.
    pub fn key_values(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("content_sha256".to_string(), self.content_sha256.clone())];
        let fields = [
            ("company_id", &self.company_id),
            ("store_id", &self.store_id),
            ("mid", &self.mid),
            ("mtx_pos_version", &self.mtx_pos_version),
            ("mtx_eps_version", &self.mtx_eps_version),
            ("seccode_version", &self.seccode_version),
            ("pos_version", &self.pos_version),
            ("pinpad_model", &self.pinpad_model),
            ("pinpad_serial", &self.pinpad_serial),
            ("pinpad_firmware", &self.pinpad_firmware),
            ("pinpad_os", &self.pinpad_os),
            ("pinpad_kernel", &self.pinpad_kernel),
            ("ip_address", &self.ip_address),
        ];
        pairs.extend(
            fields
                .into_iter()
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone()))),
        );
        if !self.server_hosts.is_empty() {
            pairs.push(("server_hosts".to_string(), self.server_hosts.join(",")));
        }
        pairs.extend(
            self.config
                .iter()
                .map(|(k, v)| (format!("config.{}", k), v.clone())),
        );
        pairs
    }
}

pub fn content_sha256(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

struct Patterns {
    company: Vec<Regex>,
    store: Vec<Regex>,
    mid: Regex,
    mtx_pos: Vec<Regex>,
    mtx_eps: Vec<Regex>,
    seccode: Vec<Regex>,
    pos_version: Vec<Regex>,
    pinpad_model: Vec<Regex>,
    pinpad_serial: Vec<Regex>,
    firmware: Regex,
    pinpad_os: Vec<Regex>,
    kernel: Regex,
    ip_address: Vec<Regex>,
    server_url: Regex,
    settings: Vec<(&'static str, Regex)>,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("Invalid identity pattern")
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| compile(p)).collect()
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    company: compile_all(&[
        r"\bAa=(\d+)",
        r"Company[\[(](\d+)[\])]",
        r#""CompanyNumber"\s*:\s*"?(\d+)"?"#,
    ]),
    store: compile_all(&[
        r"\bAb=(\d+)",
        r"Store[\[(](\d+)[\])]",
        r"StoreNumber\s*>(\d+)<",
        r#""StoreNumber"\s*:\s*"?(\d+)"?"#,
    ]),
    mid: compile(r#""MID"\s*:\s*"([^"]+)""#),
    mtx_pos: compile_all(&[
        r"MTX_POS\.dll\s+ver\w*\s*[=:]\s*([\d.]+)",
        r"MTX_POS\.dll\D*(\d+\.\d+\.\d+\.\d+)",
    ]),
    mtx_eps: compile_all(&[
        r"MTX_EPS\.dll\s+ver\w*\s*[=:]\s*([\d.]+)",
        r"MTX_EPS\.dll\D*(\d+\.\d+\.\d+\.\d+)",
    ]),
    seccode: compile_all(&[
        r"SecCode\s+ver\w*\s*[=:]\s*([\d.]+)",
        r"SecCode\D*(\d+\.\d+\.\d+)",
    ]),
    pos_version: compile_all(&[
        r"POS\s+Version\s*[=:]\s*([\d.]+)",
        r"POS Version Number:\s*([\d.]+)",
    ]),
    pinpad_model: compile_all(&[
        r#"TermType="([^"]+)""#,
        r"(XPI-Engage[A-Za-z0-9._-]*|Engage\s*[A-Za-z0-9._-]+|Lane/\d+)",
    ]),
    pinpad_serial: compile_all(&[
        r"<SerialNumber>(\S+)</SerialNumber>",
        r"Serial#?\s*[=:]\s*(\S+)",
    ]),
    firmware: compile(r"Firmware\s+Ver\w*\s*[=:]\s*([\d.]+\S*)"),
    pinpad_os: compile_all(&[
        r"<OSVersion>([^<]+)</OSVersion>",
        r"OS\s+Release\s*[=:]\s*(.+?)(?:\s{2,}|$)",
    ]),
    kernel: compile(r"Kernel\s+Ver\w*\s*[=:]\s*(.+?)(?:\s{2,}|$)"),
    ip_address: compile_all(&[
        r"<IPAddress>([\d.]+)</IPAddress>",
        r"(?:Local|IP|My)\s*(?:IP|Addr|Address)\s*[=:]\s*([\d.]+)",
    ]),
    server_url: compile(r"(https?://\S*(?:trn|svc)\d\S*)"),
    settings: vec![
        ("EndOrderIntervalMsg", compile(r"EndOrderIntervalMsg\s*[=:]\s*(\d+)")),
        ("LeaveTerminalActive", compile(r"LeaveTerminalActive\s*[=:]\s*(\w+)")),
        ("MakeMXfaster", compile(r"MakeMXfaster\s*[=:]\s*(\w+)")),
        ("C30Delay", compile(r"C30Delay\s*[=:]\s*(\d+)")),
        ("UIsoio", compile(r"UIsoio:\s*(.+)")),
        ("timeout", compile(r"timeout\s*=\s*(\d+)")),
    ],
});

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|p| {
        p.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn fill(slot: &mut Option<String>, patterns: &[Regex], text: &str) {
    if slot.is_none() {
        *slot = first_capture(patterns, text);
    }
}

/// Scan the first `max_entries` literal entries for identity fields.
pub fn extract_identity(content: &[u8], entries: &[JournalEntry], max_entries: usize) -> FileIdentity {
    let mut identity = FileIdentity {
        content_sha256: content_sha256(content),
        ..FileIdentity::default()
    };
    let p = &*PATTERNS;

    for entry in entries.iter().filter(|e| !e.is_expanded).take(max_entries) {
        let text = entry.message.as_str();

        fill(&mut identity.company_id, &p.company, text);
        fill(&mut identity.store_id, &p.store, text);
        fill(&mut identity.mid, std::slice::from_ref(&p.mid), text);
        fill(&mut identity.mtx_pos_version, &p.mtx_pos, text);
        fill(&mut identity.mtx_eps_version, &p.mtx_eps, text);
        fill(&mut identity.seccode_version, &p.seccode, text);
        fill(&mut identity.pos_version, &p.pos_version, text);
        if identity.pinpad_model.is_none() {
            identity.pinpad_model =
                first_capture(&p.pinpad_model, text).filter(|m| !m.contains("No PIN Pad"));
        }
        fill(&mut identity.pinpad_serial, &p.pinpad_serial, text);
        fill(&mut identity.pinpad_firmware, std::slice::from_ref(&p.firmware), text);
        fill(&mut identity.pinpad_os, &p.pinpad_os, text);
        fill(&mut identity.pinpad_kernel, std::slice::from_ref(&p.kernel), text);
        fill(&mut identity.ip_address, &p.ip_address, text);

        for (name, pattern) in &p.settings {
            if identity.config.contains_key(*name) {
                continue;
            }
            if let Some(value) = first_capture(std::slice::from_ref(pattern), text) {
                identity.config.insert(name.to_string(), value);
            }
        }

        if identity.server_hosts.len() < MAX_SERVER_HOSTS {
            if let Some(url) = first_capture(std::slice::from_ref(&p.server_url), text) {
                if !identity.server_hosts.contains(&url) {
                    identity.server_hosts.push(url);
                }
            }
        }
    }

    identity
}
