use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;

/// List snapshots.
#[derive(Debug, Parser)]
pub struct Args {}

pub fn run(repository: &Utf8Path, _args: Args) -> Result<()> {
    let (repo, _) = super::open_repository(repository)?;

    let mut rows = Vec::new();
    for mac in repo.snapshots() {
        let header = repo.get_snapshot(&mac)?;
        rows.push((header.timestamp, mac, header));
    }
    rows.sort_by_key(|(timestamp, _, _)| *timestamp);

    for (timestamp, mac, header) in rows {
        let when = jiff::Timestamp::from_nanosecond(timestamp as i128)
            .map(|t| t.to_string())
            .unwrap_or_else(|_| timestamp.to_string());
        let summary = header
            .sources
            .first()
            .map(|s| {
                format!(
                    "{} files, {} dirs, {} errors",
                    s.summary.directory.files + s.summary.below.files,
                    s.summary.directory.directories + s.summary.below.directories + 1,
                    s.summary.below.errors,
                )
            })
            .unwrap_or_default();
        let signed = if header.identity.is_some() { " signed" } else { "" };
        println!(
            "{} {} {} ({summary}){signed}",
            mac.short_name(),
            when,
            header.name
        );
    }
    Ok(())
}
