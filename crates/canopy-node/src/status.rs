//! `canopy status`: query every member of a group.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use canopy_overlay::{load_group, Client, Status, StatusRequest, StatusResponse, STATUS_SERVICE};
use serde::Serialize;

#[derive(Serialize)]
struct Report {
    address: String,
    public: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<BTreeMap<String, Status>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Prints one JSON line per member. Fails if any member did not answer.
pub async fn run(group: &Path) -> anyhow::Result<()> {
    let roster = load_group(group)
        .and_then(|g| g.to_roster())
        .with_context(|| format!("reading {}", group.display()))?;

    let client = Client::new(STATUS_SERVICE);
    let mut failed = 0;
    for si in &roster.list {
        let reply = client
            .send_message::<StatusRequest, StatusResponse>(si, &StatusRequest {})
            .await;
        let report = match reply {
            Ok(resp) => Report {
                address: si.address.to_string(),
                public: si.public.to_hex(),
                status: Some(resp.status),
                error: None,
            },
            Err(e) => {
                failed += 1;
                Report {
                    address: si.address.to_string(),
                    public: si.public.to_hex(),
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        };
        emit(&report);
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} nodes did not answer", roster.len());
    }
    Ok(())
}

fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}
