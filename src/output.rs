use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ListResult, ProgressEvent, ProgressSink, SyncReport, TrackState};
use crate::gallery::GalleryResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &SyncReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_gallery(result: &GalleryResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::debug!(elapsed_ms = elapsed.as_millis(), "{}", event.message),
            None => tracing::debug!("{}", event.message),
        }
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_sync(report: &SyncReport) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for item in &report.items {
            let label = match (item.state, item.kept_cached) {
                (TrackState::ResolvedFresh, _) => "fresh",
                (TrackState::ResolvedFromCache, _) => "cached",
                (TrackState::Failed, true) => "failed, kept previous",
                (TrackState::Failed, false) => "failed",
                (TrackState::NeedsResolve, _) => "needs resolve",
                (TrackState::Resolving, _) => "resolving",
            };
            let mark = if item.downloaded { "+" } else { "-" };
            writeln!(out, "{mark} {} ({label})", item.id)?;
            if let Some(error) = &item.error {
                writeln!(out, "    {error}")?;
            }
            if let Some(error) = &item.cover_error {
                writeln!(out, "    cover: {error}")?;
            }
        }
        for skipped in &report.skipped {
            writeln!(out, "! {} ({})", skipped.reference, skipped.reason)?;
        }
        if report.dry_run {
            writeln!(
                out,
                "dry run: {} cached, {} to resolve, manifest not written",
                report.cached, report.planned
            )?;
        } else {
            writeln!(
                out,
                "{} fresh, {} cached, {} failed, {} retained -> {}",
                report.fresh, report.cached, report.failed, report.retained, report.manifest_path
            )?;
        }
        if report.cancelled {
            writeln!(out, "run interrupted before all tracks were processed")?;
        }
        Ok(())
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for track in &result.tracks {
            let audio = if track.audio_present { "audio" } else { "no audio" };
            let cover = if track.cover_present { "cover" } else { "no cover" };
            writeln!(
                out,
                "{}  {} - {}  [{audio}, {cover}]",
                track.id, track.title, track.artist
            )?;
        }
        writeln!(out, "{} tracks in {}", result.tracks.len(), result.manifest_path)
    }

    pub fn print_gallery(result: &GalleryResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        match &result.output {
            Some(output) => writeln!(out, "wrote {} images to {output}", result.images.len()),
            None => writeln!(out, "gallery directory not found, nothing written"),
        }
    }
}
