use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use upkeep_installer::{
    is_caused_by, ConfigOverrides, ElevationRequiredError, PipelineEvent, Platform,
    PlatformConfig, SelfUpdateHandoff, SessionState, UpdateStage,
};
use upkeep_ipc::{
    ClientEvent, Endpoint, ExtraString, IpcAction, IpcMessage, PipeClient, PipeServer,
    ResponseKind, UpdateStep,
};
use upkeep_orchestrator::{
    answer_relayed_requests, attach_to_previous_self, retry_policy, stage_failure, MessageSink,
    Notifier, PayloadSignature, RequestHandler, SelfUpdatePlan, SessionOutcome, SessionRequest,
    UpdateService, UpdateSession,
};

use crate::completion::write_completions_script;
use crate::inspect::{format_inspect_lines, format_session_lines, inspect_file, inspected_json};
use crate::render::{
    render_event_line, render_status_line, stage_position, OutputStyle, TerminalRenderer,
};
use crate::{ApplyArgs, Cli, CliUpdateStep, Commands, NotifyRequest, SessionArgs};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let overrides = ConfigOverrides {
        config_path: cli.config,
        executable_path: cli.executable,
        install_dir: cli.install_dir,
        state_dir: cli.state_dir,
        elevated: cli.elevated,
    };
    let resolve = move || PlatformConfig::resolve(overrides);
    let renderer = TerminalRenderer::current();

    match cli.command {
        Commands::Apply(args) => run_apply(&resolve()?, renderer, args),
        Commands::Resume { handoff } => run_resume(&resolve()?, renderer, &handoff),
        Commands::Status => {
            let lines = format_status_lines(&resolve()?, renderer.style())?;
            renderer.print_lines(&lines);
            Ok(())
        }
        Commands::Inspect { path, json } => {
            let inspected = inspect_file(&path)?;
            if json {
                println!("{}", inspected_json(&inspected)?);
            } else {
                renderer.print_lines(&format_inspect_lines(&inspected));
            }
            Ok(())
        }
        Commands::Serve(args) => {
            let config = resolve()?;
            let request = session_request(args)?;
            let session = UpdateSession::new(config.clone(), Platform::native(&config)?);
            serve_session(&config, renderer, session, request, false)
        }
        Commands::Notify {
            request,
            timeout_secs,
        } => run_notify(
            &resolve()?,
            renderer,
            &request,
            Duration::from_secs(timeout_secs),
        ),
        Commands::Channel => {
            let config = resolve()?;
            let endpoint = updater_endpoint(&config);
            println!("channel: {}", endpoint.channel());
            println!("address: {}", endpoint.address().display());
            Ok(())
        }
        Commands::Completions { shell } => {
            write_completions_script(shell, &mut std::io::stdout().lock())
        }
    }
}

fn updater_endpoint(config: &PlatformConfig) -> Endpoint {
    Endpoint::for_executable(config.executable_path(), &config.runtime_dir())
}

pub(crate) fn session_request(args: SessionArgs) -> Result<SessionRequest> {
    let plan = args.self_update;
    let self_update = match plan.self_update {
        Some(source) => {
            let signature = match (plan.self_update_public_key, plan.self_update_signature) {
                (Some(public_key_hex), Some(signature_hex)) => Some(PayloadSignature {
                    public_key_hex,
                    signature_hex,
                }),
                (None, None) => None,
                _ => bail!("--self-update-public-key and --self-update-signature go together"),
            };
            Some(SelfUpdatePlan {
                source,
                sha256: plan
                    .self_update_sha256
                    .context("--self-update requires --self-update-sha256")?,
                signature,
                executable: plan
                    .self_update_exe
                    .context("--self-update requires --self-update-exe")?,
                is_automatic: plan.automatic,
                updating_from_service: false,
                proxy: None,
            })
        }
        None => None,
    };

    Ok(SessionRequest {
        session_id: args.session_id,
        package_dir: args.package,
        catch_all_package: args.catch_all,
        file_to_execute_after_update: args.restart,
        post_update_arguments: args.restart_args,
        self_update,
    })
}

fn run_apply(config: &PlatformConfig, renderer: TerminalRenderer, args: ApplyArgs) -> Result<()> {
    let request = session_request(args.session)?;
    let session = UpdateSession::new(config.clone(), Platform::native(config)?);
    if args.serve {
        return serve_session(config, renderer, session, request, true);
    }
    run_with_progress(renderer, session, &request)
}

fn run_with_progress(
    renderer: TerminalRenderer,
    mut session: UpdateSession,
    request: &SessionRequest,
) -> Result<()> {
    renderer.print_section("Update");
    let (tx, rx) = mpsc::channel();
    let view = spawn_progress_view(renderer, rx)?;
    let result = session.run(request, Some(tx));
    if view.join().is_err() {
        tracing::warn!("progress view panicked");
    }
    report_outcome(renderer, result)
}

fn spawn_progress_view(
    renderer: TerminalRenderer,
    events: Receiver<PipelineEvent>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("upkeep-progress".to_string())
        .spawn(move || {
            let style = renderer.style();
            let total = stage_position(UpdateStage::Done);
            let mut progress = renderer.start_progress("update", total);
            let mut finished = false;
            for event in events {
                match &event {
                    PipelineEvent::StageStarted(stage) => {
                        progress.set(stage_position(*stage), stage.as_str());
                    }
                    PipelineEvent::Progress { stage, status, .. } => {
                        progress.set(stage_position(*stage), status);
                    }
                    PipelineEvent::Finished => finished = true,
                    _ => {}
                }
                if let Some(line) = render_event_line(style, &event) {
                    progress.println(&line);
                }
            }
            if finished {
                progress.set(total, "done");
                progress.finish_success();
            } else {
                progress.finish_abandon();
            }
        })
        .context("failed to start progress view")
}

fn report_outcome(renderer: TerminalRenderer, result: Result<SessionOutcome>) -> Result<()> {
    match result {
        Ok(outcome) => {
            renderer.print_lines(&format_outcome_lines(&outcome, renderer.style()));
            Ok(())
        }
        Err(err) => {
            renderer.print_lines(&format_failure_lines(&err, renderer.style()));
            Err(err)
        }
    }
}

pub(crate) fn format_outcome_lines(outcome: &SessionOutcome, style: OutputStyle) -> Vec<String> {
    match outcome {
        SessionOutcome::Installed {
            session_id,
            used_catch_all,
            launched_after_update,
        } => {
            let mut message = match session_id {
                Some(id) => format!("update {id} installed"),
                None => "update installed".to_string(),
            };
            if *used_catch_all {
                message.push_str(" from the catch-all package");
            }
            let mut lines = vec![render_status_line(style, "ok", &message)];
            if let Some(program) = launched_after_update {
                lines.push(render_status_line(
                    style,
                    "ok",
                    &format!("started {}", program.display()),
                ));
            }
            lines
        }
        SessionOutcome::HandedOff(hand_off) => vec![render_status_line(
            style,
            "ok",
            &format!(
                "new updater {} started (pid {}); it continues the update",
                hand_off.new_self.display(),
                hand_off.pid
            ),
        )],
    }
}

pub(crate) fn format_failure_lines(err: &anyhow::Error, style: OutputStyle) -> Vec<String> {
    if is_caused_by::<ElevationRequiredError>(err) {
        return vec![render_status_line(
            style,
            "err",
            "elevation required: rerun from an elevated shell with --elevated",
        )];
    }
    let Some(failure) = stage_failure(err) else {
        return Vec::new();
    };
    let mut lines = vec![render_status_line(
        style,
        "err",
        &if failure.is_cancelled() {
            format!("update cancelled during {}", failure.stage)
        } else {
            format!("update failed during {}", failure.stage)
        },
    )];
    for rollback_failure in &failure.rollback.failures {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "could not revert {}: {}",
                rollback_failure.entry, rollback_failure.error
            ),
        ));
    }
    lines
}

fn serve_session(
    config: &PlatformConfig,
    renderer: TerminalRenderer,
    session: UpdateSession,
    request: SessionRequest,
    start_now: bool,
) -> Result<()> {
    config.ensure_base_dirs()?;
    let endpoint = updater_endpoint(config);
    let (tx, rx) = mpsc::channel();
    let server = Arc::new(
        PipeServer::start(endpoint.clone(), tx)
            .with_context(|| format!("failed to serve on {}", endpoint.channel()))?,
    );
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&server) as Arc<dyn MessageSink>,
        retry_policy(config.notify()),
    ));
    renderer.print_status("step", &format!("listening on {}", endpoint.channel()));

    let mut service = UpdateService::new(
        Arc::clone(&server),
        session.with_notifier(notifier),
        request,
    );
    if start_now {
        service.start_now()?;
    }
    match service.run(rx) {
        Ok(Some(outcome)) => report_outcome(renderer, Ok(outcome)),
        Ok(None) => {
            renderer.print_status("warn", "no installation was requested");
            Ok(())
        }
        Err(err) => report_outcome(renderer, Err(err)),
    }
}

fn run_resume(config: &PlatformConfig, renderer: TerminalRenderer, handoff_path: &Path) -> Result<()> {
    let handoff = SelfUpdateHandoff::load(handoff_path)?
        .with_context(|| format!("no handoff file at {}", handoff_path.display()))?;
    if !handoff.is_new_self {
        bail!(
            "{} does not hand the session to a new updater",
            handoff_path.display()
        );
    }
    if SessionState::load(&config.session_state_path())?.is_none() {
        bail!(
            "no session to resume in {}",
            config.session_state_path().display()
        );
    }

    let mut session = UpdateSession::new(config.clone(), Platform::native(config)?)
        .spare_processes(handoff.old_self_pid);
    let relay = match attach_to_previous_self(config, &handoff) {
        Ok((client, events)) => {
            let handler = RequestHandler::new(session.cancel_flag());
            let worker = answer_relayed_requests(Arc::clone(&client), events, handler)
                .context("failed to start relayed request handler")?;
            let sink = Arc::clone(&client) as Arc<dyn MessageSink>;
            session = session.with_notifier(Arc::new(Notifier::new(
                sink,
                retry_policy(config.notify()),
            )));
            Some((client, worker))
        }
        Err(err) => {
            tracing::warn!(
                error = %format!("{err:#}"),
                "previous updater unreachable; continuing without it"
            );
            None
        }
    };

    let result = run_with_progress(renderer, session, &SessionRequest::default());

    if let Err(err) = SelfUpdateHandoff::delete(handoff_path) {
        tracing::warn!(error = %format!("{err:#}"), "failed to remove handoff file");
    }
    if let Some((client, worker)) = relay {
        client.close();
        if worker.join().is_err() {
            tracing::warn!("relayed request handler panicked");
        }
    }
    result
}

pub(crate) fn format_status_lines(config: &PlatformConfig, style: OutputStyle) -> Result<Vec<String>> {
    let mut lines = vec![
        format!("install dir: {}", config.install_dir().display()),
        format!("state dir: {}", config.state_dir().display()),
    ];
    match SessionState::load(&config.session_state_path())? {
        Some(session) => lines.extend(format_session_lines(&session)),
        None => lines.push(render_status_line(
            style,
            "ok",
            "no update session in progress",
        )),
    }
    if let Some(handoff) = SelfUpdateHandoff::load(&config.handoff_path())? {
        let from = handoff.old_self_path.as_deref().unwrap_or("unknown updater");
        lines.push(render_status_line(
            style,
            "warn",
            &format!("self-update handoff pending from {from}"),
        ));
    }
    Ok(lines)
}

pub(crate) fn notify_message(request: &NotifyRequest) -> IpcMessage {
    match request {
        NotifyRequest::ProcessId => IpcMessage::action(IpcAction::GetProcessId),
        NotifyRequest::Cancel => IpcMessage::action(IpcAction::Cancel),
        NotifyRequest::Install => IpcMessage::update_step(UpdateStep::Install),
        NotifyRequest::RestartInfo { program, arguments } => {
            IpcMessage::update_step(UpdateStep::RestartInfo)
                .with_string(ExtraString::plain(program.clone().unwrap_or_default()))
                .with_string(ExtraString::plain(arguments.clone().unwrap_or_default()))
        }
        NotifyRequest::Step { step } => IpcMessage::update_step(match step {
            CliUpdateStep::CheckForUpdate => UpdateStep::CheckForUpdate,
            CliUpdateStep::DownloadUpdate => UpdateStep::DownloadUpdate,
            CliUpdateStep::BeginExtraction => UpdateStep::BeginExtraction,
            CliUpdateStep::ForceRecheck => UpdateStep::ForceRecheck,
        }),
    }
}

/// Whether `reply` ends the wait for `request`. `Cancel` expects no answer.
pub(crate) fn is_final_answer(request: &IpcMessage, reply: &IpcMessage) -> bool {
    match request.action {
        IpcAction::GetProcessId => reply.process_id.is_some(),
        IpcAction::UpdateStep => {
            reply.action == IpcAction::UpdateStep
                && reply.step == request.step
                && matches!(
                    reply.response,
                    ResponseKind::Succeeded | ResponseKind::Failed
                )
        }
        IpcAction::Cancel | IpcAction::NewProcess => true,
    }
}

pub(crate) fn format_message_line(style: OutputStyle, message: &IpcMessage) -> String {
    if let Some(pid) = message.process_id {
        return render_status_line(style, "ok", &format!("updater pid {pid}"));
    }
    let step = format!("{:?}", message.step);
    let strings = message
        .extra_strings
        .iter()
        .map(|extra| extra.text.as_str())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();
    match message.response {
        ResponseKind::Progress => render_status_line(
            style,
            "step",
            format!(
                "{step} {}% {}",
                message.progress.unwrap_or_default(),
                strings.join(" ")
            )
            .trim_end(),
        ),
        ResponseKind::Succeeded => render_status_line(style, "ok", &format!("{step} succeeded")),
        ResponseKind::Failed => render_status_line(
            style,
            "err",
            &format!("{step} failed: {}", strings.join(": ")),
        ),
        ResponseKind::None => render_status_line(
            style,
            "step",
            format!("{step} {}", strings.join(" ")).trim_end(),
        ),
    }
}

fn run_notify(
    config: &PlatformConfig,
    renderer: TerminalRenderer,
    request: &NotifyRequest,
    timeout: Duration,
) -> Result<()> {
    let endpoint = updater_endpoint(config);
    let (tx, rx) = mpsc::channel();
    let client = PipeClient::connect(&endpoint, tx)
        .with_context(|| format!("no updater is listening on {}", endpoint.channel()))?;
    let message = notify_message(request);
    client
        .send(&message)
        .with_context(|| format!("failed to send request to {}", endpoint.channel()))?;
    if message.action == IpcAction::Cancel {
        renderer.print_status("ok", "cancel requested");
        return Ok(());
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(ClientEvent::Message(reply)) => {
                println!("{}", format_message_line(renderer.style(), &reply));
                if is_final_answer(&message, &reply) {
                    if reply.response == ResponseKind::Failed {
                        bail!("the updater reported a failure");
                    }
                    return Ok(());
                }
            }
            Ok(ClientEvent::Disconnected) | Err(RecvTimeoutError::Disconnected) => {
                bail!("the updater closed the connection before answering")
            }
            Err(RecvTimeoutError::Timeout) => {
                bail!("no answer from the updater within {}s", timeout.as_secs())
            }
        }
    }
}
