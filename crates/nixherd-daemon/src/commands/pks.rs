//! `pks` — package listing and control commands.

use std::fmt::Write as _;

use nixherd_core::supervisor::{RunStatus, RunnableSnapshot};

use super::{ensure_materialized, CommandContext, ExecResult, Outcome, PksAction};

pub(super) async fn run(ctx: &CommandContext, action: Option<PksAction>) -> Outcome {
    match action {
        None => Outcome::Done(list(ctx).await),
        Some(PksAction::Start { key }) => Outcome::Done(start(ctx, &key).await),
        Some(PksAction::Stop { key }) => Outcome::Done(stop(ctx, &key).await),
        Some(PksAction::Status { key }) => Outcome::Done(status(ctx, key.as_deref()).await),
        Some(PksAction::Logs { key }) => logs(ctx, key).await,
    }
}

/// Like the other subcommands, `logs` needs supervisor state: hydrate an
/// empty map before the server opens the stream, so the first command after
/// boot can tail a key that the active repository resolves.
async fn logs(ctx: &CommandContext, key: String) -> Outcome {
    let mut out = String::new();
    if let Err(err) = ensure_materialized(ctx, &mut out).await {
        return Outcome::Done(ExecResult::failure(out, err));
    }
    Outcome::Tail { key }
}

async fn list(ctx: &CommandContext) -> ExecResult {
    let mut out = String::new();
    if let Err(err) = ensure_materialized(ctx, &mut out).await {
        return ExecResult::failure(out, err);
    }

    let snapshots = ctx.supervisor.list();
    out.push_str("\n⚡ Nixherd Packages\n");
    let last = snapshots.len().saturating_sub(1);
    for (i, snap) in snapshots.iter().enumerate() {
        let branch = if i == last { "╰──" } else { "├──" };
        let _ = writeln!(out, "{branch} {} #{} {}", snap.name, snap.key, snap.status);
    }
    if snapshots.is_empty() {
        out.push_str("(no packages)\n");
    }
    out.push_str("\nNext steps: nixherd pks <start/stop/status/logs> <key>\n");

    ExecResult::success(out)
}

async fn start(ctx: &CommandContext, key: &str) -> ExecResult {
    let mut out = String::new();
    if let Err(err) = ensure_materialized(ctx, &mut out).await {
        return ExecResult::failure(out, err);
    }

    let _ = writeln!(out, "→ Starting package {key}...");
    match ctx.supervisor.start(key) {
        Ok(_pid) => {
            let _ = write!(
                out,
                "✓ Package {key} is now running\n\n\
                 To check package status:\n  nixherd pks status {key}\n\n\
                 To view package logs:\n  nixherd pks logs {key}\n"
            );
            ExecResult::success(out)
        }
        Err(err) => ExecResult::failure(out, err),
    }
}

async fn stop(ctx: &CommandContext, key: &str) -> ExecResult {
    let mut out = String::new();
    if let Err(err) = ensure_materialized(ctx, &mut out).await {
        return ExecResult::failure(out, err);
    }

    let _ = writeln!(out, "→ Stopping package {key}...");
    match ctx.supervisor.stop(key).await {
        Ok(()) => {
            let _ = write!(
                out,
                "✓ Package {key} stopped successfully\n\n\
                 To check package status:\n  nixherd pks status {key}\n"
            );
            ExecResult::success(out)
        }
        Err(err) => ExecResult::failure(out, err),
    }
}

async fn status(ctx: &CommandContext, key: Option<&str>) -> ExecResult {
    let mut out = String::new();
    if let Err(err) = ensure_materialized(ctx, &mut out).await {
        return ExecResult::failure(out, err);
    }

    match key {
        Some(key) => detail(ctx, key, out).await,
        None => overview(ctx, out),
    }
}

fn overview(ctx: &CommandContext, mut out: String) -> ExecResult {
    let snapshots = ctx.supervisor.list();
    if snapshots.is_empty() {
        out.push_str("No packages are currently being supervised.\n");
        return ExecResult::success(out);
    }

    out.push_str("Package Status Overview\n\n");
    let _ = writeln!(out, "{:<24} {:<14} {:>8}", "PACKAGE", "STATUS", "PID");
    for snap in &snapshots {
        let pid = snap
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let _ = writeln!(out, "{:<24} {:<14} {:>8}", snap.name, snap.status.to_string(), pid);
    }
    out.push_str("\nFor detailed status of a specific package:\n  nixherd pks status <package>\n");

    ExecResult::success(out)
}

async fn detail(ctx: &CommandContext, key: &str, mut out: String) -> ExecResult {
    let snap = match ctx.supervisor.status(key) {
        Ok(snap) => snap,
        Err(err) => return ExecResult::failure(out, err),
    };
    let meta = match ctx.supervisor.metadata(key).await {
        Ok(meta) => meta,
        Err(err) => return ExecResult::failure(out, err),
    };

    out.push_str("Package Status\n\n");
    render_detail(&mut out, &snap, &meta);

    match ctx.supervisor.tail_lines(key) {
        Ok(lines) if !lines.is_empty() => {
            out.push_str("\nRecent output:\n");
            for line in lines.iter().rev().take(10).rev() {
                let _ = writeln!(out, "  {line}");
            }
        }
        _ => {}
    }

    ExecResult::success(out)
}

fn render_detail(
    out: &mut String,
    snap: &RunnableSnapshot,
    meta: &nixherd_core::supervisor::RunnableMetadata,
) {
    let _ = writeln!(out, "Name:    {}", snap.name);
    let _ = writeln!(out, "Status:  {}", snap.status);
    if let Some(pid) = snap.pid {
        let _ = writeln!(out, "PID:     {pid}");
    }
    if let Some(binary) = &snap.binary_path {
        let _ = writeln!(out, "Binary:  {}", binary.display());
    }
    if snap.status == RunStatus::Running {
        if let Some(uptime) = &meta.uptime {
            let _ = writeln!(out, "Uptime:  {uptime}");
        }
        if let Some(memory) = &meta.memory_usage {
            let _ = writeln!(out, "Memory:  {memory}");
        }
        if let Some(cpu) = &meta.cpu_usage {
            let _ = writeln!(out, "CPU:     {cpu}");
        }
    }
    if let Some(build_error) = &snap.build_error {
        let _ = writeln!(out, "Build error: {build_error}");
    }
}
