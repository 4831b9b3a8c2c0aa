use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use upkeep_core::{UpdateDetails, UPDATE_DETAILS_MAGIC};
use upkeep_installer::{
    JournalPhase, RollbackJournal, SelfUpdateHandoff, SessionState, HANDOFF_MAGIC, JOURNAL_MAGIC,
    SESSION_STATE_MAGIC,
};

/// A decoded state file, recognised by its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub(crate) enum InspectedFile {
    UpdateDetails(UpdateDetails),
    Session(SessionState),
    Handoff(SelfUpdateHandoff),
    Journal(JournalSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct JournalSummary {
    pub(crate) phase: String,
    pub(crate) entries: Vec<String>,
}

pub(crate) fn inspect_file(path: &Path) -> Result<InspectedFile> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let context = || format!("failed to decode {}", path.display());

    if bytes.starts_with(UPDATE_DETAILS_MAGIC) {
        let details = UpdateDetails::from_bytes(&bytes).with_context(context)?;
        return Ok(InspectedFile::UpdateDetails(details));
    }
    if bytes.starts_with(SESSION_STATE_MAGIC) {
        let session = SessionState::from_bytes(&bytes).with_context(context)?;
        return Ok(InspectedFile::Session(session));
    }
    if bytes.starts_with(HANDOFF_MAGIC) {
        let handoff = SelfUpdateHandoff::from_bytes(&bytes).with_context(context)?;
        return Ok(InspectedFile::Handoff(handoff));
    }
    if bytes.starts_with(JOURNAL_MAGIC) {
        let journal = RollbackJournal::load(path)?
            .with_context(|| format!("journal vanished while reading {}", path.display()))?;
        let phase = match journal.phase() {
            JournalPhase::Files => "files",
            JournalPhase::Registry => "registry",
        };
        return Ok(InspectedFile::Journal(JournalSummary {
            phase: phase.to_string(),
            entries: journal.entries().iter().map(|entry| entry.describe()).collect(),
        }));
    }
    bail!("{} is not an update state file", path.display())
}

pub(crate) fn inspected_json(file: &InspectedFile) -> Result<String> {
    serde_json::to_string_pretty(file).context("failed to serialize inspected file")
}

pub(crate) fn format_inspect_lines(file: &InspectedFile) -> Vec<String> {
    match file {
        InspectedFile::UpdateDetails(details) => format_details_lines(details),
        InspectedFile::Session(session) => format_session_lines(session),
        InspectedFile::Handoff(handoff) => format_handoff_lines(handoff),
        InspectedFile::Journal(journal) => {
            let mut lines = vec![format!(
                "journal ({} phase, {} entries)",
                journal.phase,
                journal.entries.len()
            )];
            lines.extend(journal.entries.iter().map(|entry| format!("- {entry}")));
            lines
        }
    }
}

fn format_details_lines(details: &UpdateDetails) -> Vec<String> {
    let mut lines = vec!["update details".to_string()];
    for change in &details.file_changes {
        let mut flags = Vec::new();
        if change.delete_file {
            flags.push("delete");
        }
        if change.delta_patch_relative_path.is_some() {
            flags.push("patch");
        }
        if change.execute {
            flags.push(if change.execute_before_update {
                "run-before"
            } else {
                "run-after"
            });
        }
        if change.is_managed_assembly {
            flags.push("managed");
        }
        let suffix = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        lines.push(format!("file {}{suffix}", change.relative_path));
    }
    for change in &details.registry_changes {
        lines.push(format!(
            "registry {:?} {}",
            change.operation,
            change.display_path()
        ));
    }
    for shortcut in &details.shortcuts {
        lines.push(format!(
            "shortcut {} -> {}",
            shortcut.relative_output_path.as_deref().unwrap_or("?"),
            shortcut.target_path.as_deref().unwrap_or("?")
        ));
    }
    for previous in &details.previous_shortcuts {
        lines.push(format!("remove shortcut {previous}"));
    }
    for folder in &details.folders_to_delete {
        lines.push(format!("delete folder {folder}"));
    }
    for service in &details.services_to_stop {
        lines.push(format!("stop service {service}"));
    }
    for service in &details.services_to_start {
        lines.push(
            format!("start service {} {}", service.name, service.arguments.join(" "))
                .trim_end()
                .to_string(),
        );
    }
    lines
}

pub(crate) fn format_session_lines(session: &SessionState) -> Vec<String> {
    let mut lines = vec![
        format!(
            "session {}",
            session.session_id.as_deref().unwrap_or("(unnamed)")
        ),
        format!("stage: {}", session.current_stage),
        format!(
            "last transition: {} (unix seconds)",
            session.last_transition.unix_seconds()
        ),
    ];
    if let Some(progress) = session.self_update_state {
        lines.push(format!("self-update: {}", progress.as_str()));
    }
    if let Some(temp) = &session.temp_directory {
        lines.push(format!("package: {temp}"));
    }
    if let Some(catch_all) = &session.catch_all_package {
        let attempted = if session.catch_all_attempted {
            " (attempted)"
        } else {
            ""
        };
        lines.push(format!("catch-all: {catch_all}{attempted}"));
    }
    if let Some(program) = &session.file_to_execute_after_update {
        let arguments = session.post_update_arguments.as_deref().unwrap_or_default();
        lines.push(format!("then run: {program} {arguments}").trim_end().to_string());
    }
    lines
}

fn format_handoff_lines(handoff: &SelfUpdateHandoff) -> Vec<String> {
    let mut lines = vec!["self-update handoff".to_string()];
    let optional = [
        ("previous updater", handoff.old_self_path.as_deref()),
        ("base directory", handoff.base_directory.as_deref()),
        ("temp directory", handoff.temp_directory.as_deref()),
        ("log file", handoff.log_file.as_deref()),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            lines.push(format!("{label}: {value}"));
        }
    }
    if let Some(pid) = handoff.old_self_pid {
        lines.push(format!("previous pid: {pid}"));
    }
    let flags = [
        ("new self", handoff.is_new_self),
        ("needs elevation", handoff.needs_elevation),
        ("automatic", handoff.is_automatic),
        ("from service", handoff.updating_from_service),
    ];
    let set = flags
        .iter()
        .filter(|(_, on)| *on)
        .map(|(label, _)| *label)
        .collect::<Vec<_>>();
    if !set.is_empty() {
        lines.push(format!("flags: {}", set.join(", ")));
    }
    if let Some(url) = handoff.proxy.as_ref().and_then(|proxy| proxy.url.as_deref()) {
        lines.push(format!("proxy: {url}"));
    }
    lines
}
