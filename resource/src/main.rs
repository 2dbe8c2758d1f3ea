mod output;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use output::{
    CollapseInfo, EditOutput, LookupOutput, OutputWriter, ValueData, ValueInfo, result_code,
};
use resource_core::{
    Config, Encoding, ImportEntry, KeyHash, Operation, Platform, Store, Tick, apply,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Resource - versioned resource metadata tool
#[derive(Parser, Debug)]
#[command(name = "resource")]
#[command(
    about = "Edit versioned resource properties with platform fallback",
    long_about = "Edit versioned resource properties with platform fallback.\n\n\
                  Operations (--platform, --set, --unset, --blob) apply in the order given. \
                  Queries (--get) are answered after all operations, for the platform in \
                  effect where they appear."
)]
#[command(version)]
struct Cli {
    /// Configuration file; later files override earlier ones
    #[arg(long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,

    /// Resource source directory (overrides config and RESOURCE_SOURCE_PATH)
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Resource id
    #[arg(long, value_name = "UUID")]
    id: Option<String>,

    /// Derive the resource id from a source file path
    #[arg(long, value_name = "PATH")]
    lookup: Option<PathBuf>,

    /// Platform for subsequent operations
    #[arg(long, value_name = "PLATFORM", action = ArgAction::Append)]
    platform: Vec<String>,

    /// Set KEY to VALUE
    #[arg(
        long,
        num_args = 2,
        value_names = ["KEY", "VALUE"],
        allow_hyphen_values = true,
        action = ArgAction::Append
    )]
    set: Vec<String>,

    /// Remove the value of KEY
    #[arg(long, value_name = "KEY", action = ArgAction::Append)]
    unset: Vec<String>,

    /// Set KEY to the content of FILE, stored as a blob
    #[arg(
        long,
        num_args = 2,
        value_names = ["KEY", "FILE"],
        action = ArgAction::Append
    )]
    blob: Vec<String>,

    /// Print the resolved value of KEY
    #[arg(long, value_name = "KEY", action = ArgAction::Append)]
    get: Vec<String>,

    /// Collapse history to the latest value per key and platform
    #[arg(long)]
    collapse: bool,

    /// Delete blobs no longer referenced by the log
    #[arg(long)]
    clearblobs: bool,

    /// Show what would change without writing the log or deleting blobs
    #[arg(long)]
    dry_run: bool,

    /// Write a binary log
    #[arg(long, conflicts_with = "ascii")]
    binary: bool,

    /// Write a text log
    #[arg(long)]
    ascii: bool,

    /// Keep the statements of a malformed log that parse before the error
    #[arg(long)]
    salvage: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug output
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// Only report errors
    #[arg(long)]
    quiet: bool,
}

/// A failed session with the code it surfaces.
#[derive(Debug)]
struct Failure {
    code: i32,
    error: anyhow::Error,
}

impl Failure {
    fn invalid(error: impl Into<anyhow::Error>) -> Self {
        Self {
            code: result_code::INVALID_ARGUMENT,
            error: error.into(),
        }
    }

    fn output(error: impl Into<anyhow::Error>) -> Self {
        Self {
            code: result_code::UNABLE_TO_OPEN_OUTPUT_FILE,
            error: error.into(),
        }
    }
}

/// Command line operations in the order given, with queries kept apart.
#[derive(Debug, Default, PartialEq)]
struct Plan {
    /// Platform before the first `--platform`.
    platform: Platform,
    operations: Vec<Operation>,
    /// Query key and the platform in effect where it appeared.
    queries: Vec<(String, Platform)>,
}

impl Plan {
    fn has_edits(&self) -> bool {
        self.operations
            .iter()
            .any(|op| !matches!(op, Operation::Platform(_)))
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = match Cli::command().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => return clap_failure(err),
    };
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => return clap_failure(err),
    };

    let output = OutputWriter::new(cli.json);
    let config = Config::load_all(&cli.config)
        .map(|config| config.with_env(|name| std::env::var(name).ok()));
    init_logging(&cli, config.as_ref().ok());

    let result = config
        .context("Failed to load configuration")
        .map_err(Failure::invalid)
        .and_then(|config| execute(&cli, &matches, &config, &output));

    match result {
        Ok(()) => result_code::OK,
        Err(failure) => {
            output.write_error(&failure.error, failure.code);
            failure.code
        }
    }
}

fn clap_failure(err: clap::Error) -> i32 {
    let code = match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => result_code::OK,
        ErrorKind::UnknownArgument | ErrorKind::InvalidSubcommand => result_code::UNKNOWN_COMMAND,
        _ => result_code::INVALID_ARGUMENT,
    };
    let _ = err.print();
    code
}

fn init_logging(cli: &Cli, config: Option<&Config>) {
    // Flags > config > warn
    let configured = config
        .and_then(|c| c.log_level.as_deref())
        .and_then(|level| level.parse::<tracing::Level>().ok());
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::ERROR
    } else {
        configured.unwrap_or(tracing::Level::WARN)
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// What a validated invocation works on.
#[derive(Debug)]
enum Target {
    /// Nothing requested.
    Help,
    /// Report the id of a source file path.
    Lookup(ImportEntry),
    /// Open the log of `id` in `store`.
    Session { store: Store, id: Uuid },
}

fn execute(
    cli: &Cli,
    matches: &ArgMatches,
    config: &Config,
    output: &OutputWriter,
) -> Result<(), Failure> {
    let initial_platform = config.platform().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "ignoring configured platform");
        Platform::GENERIC
    });
    let plan = plan_operations(cli, matches, initial_platform);

    match resolve_target(cli, config, &plan)? {
        Target::Help => {
            let _ = Cli::command().print_help();
            Ok(())
        }
        Target::Lookup(entry) => {
            let data = LookupOutput {
                success: true,
                result_code: result_code::OK,
                path: entry.path.clone(),
                id: entry.id.hyphenated().to_string(),
                signature: format!("{:016x}", entry.signature),
            };
            output
                .write(&data, || format!("{} {}\n", data.id, data.path))
                .map_err(Failure::output)
        }
        Target::Session { store, id } => run_session(cli, config, &store, id, &plan, output),
    }
}

/// Validate the source directory and id an invocation needs.
///
/// Edits, queries, `--collapse` and `--clearblobs` need a source directory
/// and an id. A lookup on its own needs neither.
fn resolve_target(cli: &Cli, config: &Config, plan: &Plan) -> Result<Target, Failure> {
    let needs_source =
        plan.has_edits() || !plan.queries.is_empty() || cli.collapse || cli.clearblobs;
    if !needs_source && cli.lookup.is_none() {
        return Ok(Target::Help);
    }

    let source_path = cli.source.clone().or_else(|| config.source_path.clone());
    if needs_source && source_path.is_none() {
        return Err(Failure::invalid(resource_core::Error::MissingSource));
    }
    let store = source_path.map(Store::new);

    let entry = cli
        .lookup
        .as_deref()
        .and_then(|path| lookup_entry(store.as_ref(), path));

    if !needs_source {
        // Lookup only: report the id, leave logs alone
        return entry
            .map(Target::Lookup)
            .ok_or_else(|| Failure::invalid(resource_core::Error::MissingId));
    }

    let id = cli
        .id
        .as_deref()
        .and_then(parse_id)
        .or(entry.map(|entry| entry.id))
        .ok_or_else(|| Failure::invalid(resource_core::Error::MissingId))?;
    let Some(store) = store else {
        return Err(Failure::invalid(resource_core::Error::MissingSource));
    };
    Ok(Target::Session { store, id })
}

fn run_session(
    cli: &Cli,
    config: &Config,
    store: &Store,
    id: Uuid,
    plan: &Plan,
    output: &OutputWriter,
) -> Result<(), Failure> {
    let persisted = store
        .source_encoding(id)
        .with_context(|| format!("Failed to open source {}", id))
        .map_err(Failure::output)?;
    if let Some(encoding) = persisted {
        tracing::info!(%id, encoding = encoding.as_str(), "input encoding");
    }

    let mut salvaged = false;
    let mut source = if cli.salvage {
        let (source, err) = store
            .read_source_lenient(id)
            .with_context(|| format!("Failed to read source {}", id))
            .map_err(Failure::output)?;
        if let Some(err) = err {
            tracing::warn!(%id, error = %err, kept = source.len(), "salvaged malformed source");
            salvaged = true;
        }
        source
    } else {
        store
            .read_source(id)
            .with_context(|| format!("Failed to read source {}", id))
            .map_err(Failure::output)?
    };

    let report = apply(store, &mut source, &plan.operations, plan.platform, wall_clock_tick());
    let mut data = EditOutput::new(id.hyphenated().to_string(), &report, cli.dry_run);

    data.values = plan
        .queries
        .iter()
        .map(|(key, platform)| ValueInfo {
            key: key.clone(),
            key_hash: KeyHash::of(key),
            platform: *platform,
            data: ValueData::from_resolved(source.resolve(KeyHash::of(key), *platform)),
        })
        .collect();

    let mut removed = 0;
    if cli.collapse {
        removed = source.collapse_history();
        data.collapse = Some(CollapseInfo {
            statements_removed: removed,
        });
    }
    data.statements = source.len();

    let explicit = if cli.binary {
        Some(Encoding::Binary)
    } else if cli.ascii {
        Some(Encoding::Text)
    } else {
        config.binary.map(|binary| if binary { Encoding::Binary } else { Encoding::Text })
    };
    let encoding = explicit.or(persisted).unwrap_or(Encoding::Text);
    let converting = persisted.is_some_and(|persisted| persisted != encoding);

    // A salvaged log is rewritten so the file matches what blobs are kept for
    if (report.applied > 0 || removed > 0 || converting || salvaged) && !cli.dry_run {
        store
            .write_source(&source, encoding)
            .with_context(|| format!("Unable to write source {}", store.source_path(id).display()))
            .map_err(Failure::output)?;
        data.written = Some(encoding.as_str().to_string());
    }

    // Only after the log no longer references them
    if cli.clearblobs {
        let stats = store
            .clear_blob_history(&source, cli.dry_run)
            .with_context(|| format!("Failed to clear blobs of {}", id))
            .map_err(Failure::output)?;
        data.clearblobs = Some(stats);
    }

    output
        .write(&data, || data.to_text())
        .map_err(Failure::output)
}

/// Collect operations and queries in command line order.
fn plan_operations(cli: &Cli, matches: &ArgMatches, initial_platform: Platform) -> Plan {
    enum Step {
        Op(Operation),
        Get(String),
    }

    let indices = |id: &str| -> Vec<usize> {
        matches
            .indices_of(id)
            .map(|indices| indices.collect())
            .unwrap_or_default()
    };

    let mut steps: Vec<(usize, Step)> = Vec::new();
    for (value, index) in cli.platform.iter().zip(indices("platform")) {
        match value.parse::<Platform>() {
            Ok(platform) => steps.push((index, Step::Op(Operation::Platform(platform)))),
            Err(err) => tracing::warn!(%value, error = %err, "ignoring invalid platform"),
        }
    }
    for (pair, index) in cli.set.chunks(2).zip(indices("set").into_iter().step_by(2)) {
        if let [key, value] = pair {
            let op = Operation::Set {
                key: key.clone(),
                value: value.clone(),
            };
            steps.push((index, Step::Op(op)));
        }
    }
    for (key, index) in cli.unset.iter().zip(indices("unset")) {
        steps.push((index, Step::Op(Operation::Unset { key: key.clone() })));
    }
    for (pair, index) in cli.blob.chunks(2).zip(indices("blob").into_iter().step_by(2)) {
        if let [key, file] = pair {
            let op = Operation::Blob {
                key: key.clone(),
                file: PathBuf::from(file),
            };
            steps.push((index, Step::Op(op)));
        }
    }
    for (key, index) in cli.get.iter().zip(indices("get")) {
        steps.push((index, Step::Get(key.clone())));
    }
    steps.sort_by_key(|(index, _)| *index);

    let mut plan = Plan {
        platform: initial_platform,
        ..Plan::default()
    };
    let mut platform = initial_platform;
    for (_, step) in steps {
        match step {
            Step::Op(op) => {
                if let Operation::Platform(next) = op {
                    platform = next;
                }
                plan.operations.push(op);
            }
            Step::Get(key) => plan.queries.push((key, platform)),
        }
    }
    plan
}

/// Malformed ids are logged and treated as absent.
fn parse_id(value: &str) -> Option<Uuid> {
    match Uuid::parse_str(value) {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(%value, error = %err, "ignoring invalid id");
            None
        }
    }
}

/// Resolve a path to its import entry, recording it when a store is known.
fn lookup_entry(store: Option<&Store>, path: &Path) -> Option<ImportEntry> {
    let result = match store {
        Some(store) => store.import_map().lookup(path),
        None => ImportEntry::derive(path),
    };
    match result {
        Ok(entry) => Some(entry),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "lookup failed");
            None
        }
    }
}

/// Milliseconds since the Unix epoch.
fn wall_clock_tick() -> Tick {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(args: &[&str]) -> Plan {
        let matches = Cli::command().try_get_matches_from(args).unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        plan_operations(&cli, &matches, Platform::GENERIC)
    }

    #[test]
    fn test_operations_keep_command_line_order() {
        let plan = plan(&[
            "resource", "--set", "size", "100", "--platform", "0x01", "--unset", "size",
            "--set", "name", "-ship", "--blob", "texture", "ship.png",
        ]);
        assert_eq!(
            plan.operations,
            vec![
                Operation::Set {
                    key: "size".to_string(),
                    value: "100".to_string()
                },
                Operation::Platform(Platform::from_u64(1)),
                Operation::Unset {
                    key: "size".to_string()
                },
                Operation::Set {
                    key: "name".to_string(),
                    value: "-ship".to_string()
                },
                Operation::Blob {
                    key: "texture".to_string(),
                    file: PathBuf::from("ship.png")
                },
            ]
        );
        assert!(plan.has_edits());
    }

    #[test]
    fn test_queries_capture_platform() {
        let plan = plan(&[
            "resource", "--get", "size", "--platform", "platform=2", "--get", "size",
            "--platform", "bogus", "--get", "name",
        ]);
        assert_eq!(
            plan.queries,
            vec![
                ("size".to_string(), Platform::GENERIC),
                ("size".to_string(), Platform::from_u64(2)),
                ("name".to_string(), Platform::from_u64(2)),
            ]
        );
        assert!(!plan.has_edits());
    }

    #[test]
    fn test_parse_errors_map_to_result_codes() {
        let unknown = Cli::command()
            .try_get_matches_from(["resource", "--frobnicate"])
            .unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::UnknownArgument);

        let conflict = Cli::command()
            .try_get_matches_from(["resource", "--binary", "--ascii"])
            .unwrap_err();
        assert_eq!(conflict.kind(), ErrorKind::ArgumentConflict);

        let missing = Cli::command()
            .try_get_matches_from(["resource", "--set", "size"])
            .unwrap_err();
        assert_ne!(missing.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::from_u128(42);
        assert_eq!(parse_id(&id.to_string()), Some(id));
        assert_eq!(parse_id("not-an-id"), None);
    }

    fn parse(args: &[&str]) -> (Cli, ArgMatches) {
        let matches = Cli::command().try_get_matches_from(args).unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        (cli, matches)
    }

    fn target(args: &[&str]) -> Result<Target, Failure> {
        let (cli, matches) = parse(args);
        let plan = plan_operations(&cli, &matches, Platform::GENERIC);
        resolve_target(&cli, &Config::default(), &plan)
    }

    fn invoke(args: &[&str]) -> Result<(), Failure> {
        let (cli, matches) = parse(args);
        execute(&cli, &matches, &Config::default(), &OutputWriter::new(true))
    }

    fn core_error(failure: &Failure) -> Option<&resource_core::Error> {
        failure.error.downcast_ref::<resource_core::Error>()
    }

    #[test]
    fn test_nothing_requested_shows_help() {
        assert!(matches!(target(&["resource"]), Ok(Target::Help)));
        assert!(matches!(
            target(&["resource", "--platform", "0x01", "--dry-run"]),
            Ok(Target::Help)
        ));
    }

    #[test]
    fn test_source_required_for_edits_and_maintenance() {
        let id = Uuid::from_u128(9).to_string();
        for args in [
            vec!["resource", "--id", id.as_str(), "--set", "size", "1"],
            vec!["resource", "--id", id.as_str(), "--get", "size"],
            vec!["resource", "--id", id.as_str(), "--collapse"],
            vec!["resource", "--id", id.as_str(), "--clearblobs"],
        ] {
            let failure = target(&args).unwrap_err();
            assert_eq!(failure.code, result_code::INVALID_ARGUMENT);
            assert!(matches!(
                core_error(&failure),
                Some(resource_core::Error::MissingSource)
            ));
        }
    }

    #[test]
    fn test_failed_lookup_without_id_is_missing_id() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let source = temp_dir.path().to_str().unwrap();

        let failure = target(&[
            "resource", "--source", source, "--lookup", "/assets/a\nb.obj", "--set", "size", "1",
        ])
        .unwrap_err();
        assert_eq!(failure.code, result_code::INVALID_ARGUMENT);
        assert!(matches!(
            core_error(&failure),
            Some(resource_core::Error::MissingId)
        ));

        // Lookup on its own fails the same way
        let failure = target(&["resource", "--source", source, "--lookup", "/assets/a\nb.obj"])
            .unwrap_err();
        assert!(matches!(
            core_error(&failure),
            Some(resource_core::Error::MissingId)
        ));
    }

    #[test]
    fn test_malformed_id_alone_is_missing_id() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let source = temp_dir.path().to_str().unwrap();

        let failure = target(&[
            "resource", "--source", source, "--id", "not-an-id", "--set", "size", "1",
        ])
        .unwrap_err();
        assert_eq!(failure.code, result_code::INVALID_ARGUMENT);
        assert!(matches!(
            core_error(&failure),
            Some(resource_core::Error::MissingId)
        ));
    }

    #[test]
    fn test_lookup_only_records_without_touching_logs() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let source = temp_dir.path().to_str().unwrap();

        let resolved = target(&["resource", "--source", source, "--lookup", "/assets/ship.obj"])
            .unwrap();
        let entry = match resolved {
            Target::Lookup(entry) => entry,
            other => panic!("expected a lookup, got {:?}", other),
        };
        let store = Store::new(temp_dir.path());
        assert_eq!(store.import_map().entries().unwrap(), vec![entry]);
        assert!(!temp_dir.path().join("sources").exists());

        // No source directory: derived, nothing recorded
        assert!(matches!(
            target(&["resource", "--lookup", "/assets/ship.obj"]),
            Ok(Target::Lookup(_))
        ));

        invoke(&["resource", "--source", source, "--lookup", "/assets/ship.obj"]).unwrap();
        assert_eq!(store.import_map().entries().unwrap().len(), 1);
        assert!(!temp_dir.path().join("sources").exists());
    }

    #[test]
    fn test_malformed_id_falls_back_to_lookup() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let source = temp_dir.path().to_str().unwrap();

        invoke(&[
            "resource", "--source", source, "--id", "not-an-id", "--lookup", "/assets/ship.obj",
            "--set", "size", "100",
        ])
        .unwrap();

        let store = Store::new(temp_dir.path());
        let entry = store
            .import_map()
            .lookup(Path::new("/assets/ship.obj"))
            .unwrap();
        assert!(store.source_path(entry.id).exists());
        let log = store.read_source(entry.id).unwrap();
        assert_eq!(
            log.resolve(KeyHash::of("size"), Platform::GENERIC)
                .unwrap()
                .as_str(),
            Some("100")
        );
    }

    #[test]
    fn test_salvaged_log_is_written_before_clearing_blobs() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Store::new(temp_dir.path());
        let id = Uuid::from_u128(0x5a1);
        let texture = KeyHash::of("texture");
        let data = b"pixels";
        let checksum = resource_core::Hash::hash_bytes(data);
        store
            .blobs()
            .write(id, texture, Platform::GENERIC, &checksum, data)
            .unwrap();

        let mut log = resource_core::ResourceSource::new(id);
        log.set(1, KeyHash::of("size"), Platform::GENERIC, "100")
            .unwrap();
        log.set_blob(2, texture, Platform::GENERIC, checksum, data.len() as u64)
            .unwrap();
        store.write_source(&log, Encoding::Text).unwrap();

        // Break the record before the blob reference
        let path = store.source_path(id);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        std::fs::write(
            &path,
            format!("{}\n{}\nbroken\n{}\n", lines[0], lines[1], lines[2]),
        )
        .unwrap();

        let id_arg = id.to_string();
        let source = temp_dir.path().to_str().unwrap();
        invoke(&[
            "resource", "--source", source, "--id", id_arg.as_str(), "--salvage", "--clearblobs",
        ])
        .unwrap();

        assert!(store.blobs().list(id).unwrap().is_empty());
        let persisted = store.read_source(id).unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted.referenced_blobs().is_empty());
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }
}
