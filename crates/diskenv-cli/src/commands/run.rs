use super::{exit_code, json_line, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use crate::render::{JsonNotifier, LogFileNotifier, SpinnerNotifier};
use diskenv_core::{DiskImage, EventBus, LifecycleError, Orchestrator, OrchestratorConfig, Task};
use diskenv_runtime::{select_backend, BackendOptions, Drive};
use diskenv_schema::{parse_manifest_file, ManifestV1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct RunOptions<'a> {
    pub manifest: &'a Path,
    pub disk: Option<&'a Path>,
    pub json: bool,
    pub log_file: Option<&'a Path>,
}

fn load_manifest(options: &RunOptions<'_>) -> Result<ManifestV1, String> {
    if options.manifest.is_file() {
        debug!("loading manifest {}", options.manifest.display());
        return parse_manifest_file(options.manifest).map_err(|e| format!("manifest error: {e}"));
    }
    if options.disk.is_some() {
        debug!("no manifest at {}, using defaults", options.manifest.display());
        return Ok(ManifestV1::default());
    }
    Err(format!(
        "manifest error: {} not found and no --disk given",
        options.manifest.display()
    ))
}

fn resolve_disk(options: &RunOptions<'_>, manifest: &ManifestV1) -> Result<PathBuf, String> {
    let manifest_dir = options
        .manifest
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let disk = options
        .disk
        .map(Path::to_path_buf)
        .or_else(|| manifest.disk_path(manifest_dir))
        .ok_or("manifest error: no disk file; set [disk] file or pass --disk")?;
    if disk.is_absolute() {
        return Ok(disk);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("cannot resolve {}: {e}", disk.display()))?;
    Ok(cwd.join(disk))
}

pub fn run(drive: Drive, task: Task, options: &RunOptions<'_>) -> Result<u8, String> {
    let manifest = load_manifest(options)?;
    let disk_file = resolve_disk(options, &manifest)?;
    let disk = DiskImage::new(disk_file, drive);

    let backend_options = BackendOptions {
        partition_tool: manifest.runtime.partition_tool.clone(),
        kill_tool: manifest.runtime.kill_tool.clone(),
        state_dir: disk
            .file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
    };
    let backend = select_backend(&manifest.runtime.backend, &backend_options)
        .map_err(|e| format!("runtime error: {e}"))?;
    debug!("using {} backend", backend.name);

    let bus = Arc::new(EventBus::with_tracing());
    let pb = if options.json {
        bus.subscribe(JsonNotifier::new(std::io::stdout()));
        None
    } else {
        let pb = spinner(&format!("{task} {}", disk.name));
        bus.subscribe(SpinnerNotifier::new(pb.clone()));
        Some(pb)
    };
    if let Some(path) = options.log_file {
        let notifier = LogFileNotifier::open(path)
            .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
        bus.subscribe(notifier);
    }

    let orchestrator = Orchestrator::new(
        backend,
        Arc::clone(&bus),
        OrchestratorConfig::from_manifest(&manifest),
    );
    let worker = orchestrator
        .spawn(task, disk.clone())
        .map_err(|e| format!("failed to start lifecycle worker: {e}"))?;
    let result = worker
        .join()
        .map_err(|_| "lifecycle worker panicked".to_owned())?;
    bus.flush();

    match result {
        Ok(()) => {
            if let Some(pb) = &pb {
                spin_ok(pb, &format!("{task} {} on {}", disk.name, disk.drive));
            } else {
                print_summary(task, &disk, None)?;
            }
            Ok(EXIT_SUCCESS)
        }
        Err(err) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("{task} {} failed", disk.name));
                report(&err);
            } else {
                print_summary(task, &disk, Some(&err))?;
            }
            Ok(exit_code(err.exit_signal()))
        }
    }
}

fn report(err: &LifecycleError) {
    eprintln!(
        "{} {err}",
        console::style(format!("error ({}):", err.kind)).red().bold()
    );
    if let Some(output) = &err.output {
        for line in output.lines() {
            eprintln!("    {line}");
        }
    }
}

fn print_summary(task: Task, disk: &DiskImage, err: Option<&LifecycleError>) -> Result<(), String> {
    let summary = serde_json::json!({
        "task": task.keyword(),
        "disk": disk.file.display().to_string(),
        "drive": disk.drive.to_string(),
        "status": if err.is_some() { "failed" } else { "ok" },
        "error": err.map(|e| serde_json::json!({
            "kind": e.kind,
            "context": e.context,
            "message": e.message,
            "output": e.output,
        })),
        "exit_code": err.map_or(EXIT_SUCCESS, |e| exit_code(e.exit_signal())),
    });
    println!("{}", json_line(&summary)?);
    Ok(())
}
