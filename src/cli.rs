//! Command-line interface for xspawn
//!
//! `xspawn run -- <program> [args...]` runs a program through the collected
//! API and mirrors its output and exit status. `xspawn config` prints the
//! effective configuration with the source of every value.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::ffi::OsString;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::{debug, error, warn};

use crate::exit_codes::ExitCode;
use crate::logging;
use xspawn_config::{CliArgs, Config};
use xspawn_runner::{
    Arguments, CollectedResult, Configuration, Environment, Executable, InputMethod,
    OutputMethod, ProcessIdentifier, RunnerError, StringOrRawBytes, TerminationStatus,
};

/// xspawn - structured subprocess execution
#[derive(Parser, Debug)]
#[command(name = "xspawn")]
#[command(about = "Run a program with piped I/O, bounded capture and process-group cleanup")]
#[command(long_about = r#"
xspawn runs a program without a shell, captures its output up to a limit,
and cleans up every descriptor and the child's process group on exit,
failure or Ctrl-C.

EXAMPLES:
  # Run a program and mirror its output and exit code
  xspawn run -- ls -la

  # Feed a file to standard input and report as JSON
  xspawn run --stdin input.txt --json -- wc -l

  # Stream standard error straight to the terminal
  xspawn run --stderr inherit -- make

  # Show the effective configuration
  xspawn config

CONFIGURATION:
  Configuration is loaded with precedence: CLI flags > config file > defaults
  Config file is discovered by searching upward from CWD for .xspawn/config.toml
  Use --config to specify an explicit config file path
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on standard error
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program and mirror its output and exit status
    Run(RunArgs),

    /// Print the effective configuration and where each value came from
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// What to do with one of the child's output streams.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Capture up to the limit, then print after the child exits
    Collect,
    /// Send to /dev/null
    Discard,
    /// Write directly to this process's stream
    Inherit,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// File fed to the child's standard input ("-" passes this process's stdin through)
    #[arg(long, value_name = "FILE")]
    pub stdin: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StreamMode::Collect)]
    pub stdout: StreamMode,

    #[arg(long, value_enum, default_value_t = StreamMode::Collect)]
    pub stderr: StreamMode,

    /// Capture limit for standard output in bytes
    #[arg(long, value_name = "BYTES")]
    pub stdout_limit: Option<usize>,

    /// Capture limit for standard error in bytes
    #[arg(long, value_name = "BYTES")]
    pub stderr_limit: Option<usize>,

    /// Set an environment variable for the child (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Start from an empty environment instead of inheriting this one
    #[arg(long)]
    pub clear_env: bool,

    /// Working directory for the child
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Value passed as argv[0]
    #[arg(long)]
    pub argv0: Option<OsString>,

    /// Keep the child in xspawn's process group
    #[arg(long)]
    pub no_process_group: bool,

    /// Print the collected result as JSON instead of mirroring output
    #[arg(long)]
    pub json: bool,

    /// Program followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("missing variable name in '{raw}'")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// JSON shape of `xspawn run --json`.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub process_identifier: ProcessIdentifier,
    pub termination_status: TerminationStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl From<&CollectedResult> for RunReport {
    fn from(result: &CollectedResult) -> Self {
        Self {
            process_identifier: result.process_identifier,
            termination_status: result.termination_status,
            success: result.success(),
            stdout: result.standard_output.as_ref().map(|_| result.stdout_string()),
            stderr: result.standard_error.as_ref().map(|_| result.stderr_string()),
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
        }
    }
}

enum StandardInput {
    None,
    Inherit,
    Bytes(Vec<u8>),
}

/// Maps parsed flags onto the configuration layer. Unset flags stay `None`
/// so the config file and defaults still apply.
#[must_use]
pub fn build_cli_args(cli: &Cli) -> CliArgs {
    let run = match &cli.command {
        Commands::Run(run) => Some(run),
        Commands::Config { .. } => None,
    };

    CliArgs {
        config_path: cli.config.clone(),
        stdout_limit_bytes: run.and_then(|r| r.stdout_limit),
        stderr_limit_bytes: run.and_then(|r| r.stderr_limit),
        create_process_group: run.filter(|r| r.no_process_group).map(|_| false),
        create_session: None,
        working_directory: run.and_then(|r| r.cwd.clone()),
        verbose: cli.verbose.then_some(true),
        log_json: cli.log_json.then_some(true),
    }
}

/// Builds the engine configuration for a `run` invocation.
pub fn build_configuration(args: &RunArgs, config: &Config) -> Result<Configuration, String> {
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| "no program given".to_string())?;

    let executable = if program.as_bytes().contains(&b'/') {
        Executable::at(PathBuf::from(program))
    } else {
        let name = program
            .to_str()
            .ok_or_else(|| format!("program name is not valid UTF-8: {}", program.display()))?;
        Executable::named(name)
    };

    let values = rest.iter().map(|arg| StringOrRawBytes::from(arg.clone()));
    let arguments = Arguments::with_executable_path_override(args.argv0.clone(), values);

    let overrides = args.env.iter().map(|(k, v)| (k.as_str(), v.as_str()));
    let environment = if args.clear_env {
        Environment::custom(overrides)
    } else {
        Environment::inherit().updating(overrides)
    };

    let mut configuration = Configuration::new(executable)
        .with_arguments(arguments)
        .with_environment(environment)
        .with_platform_options(config.platform_options());
    if let Some(dir) = &config.process.working_directory {
        configuration = configuration.with_working_directory(dir.clone());
    }

    Ok(configuration)
}

fn output_method(
    mode: StreamMode,
    limit: usize,
    inherited: &impl AsFd,
) -> Result<OutputMethod, RunnerError> {
    match mode {
        StreamMode::Collect => Ok(OutputMethod::collect_with_limit(limit)),
        StreamMode::Discard => Ok(OutputMethod::discard()),
        StreamMode::Inherit => OutputMethod::write_to_borrowed(inherited),
    }
}

fn output_methods(
    args: &RunArgs,
    config: &Config,
) -> Result<(OutputMethod, OutputMethod), RunnerError> {
    let stdout = output_method(
        args.stdout,
        config.capture.stdout_limit_bytes,
        &std::io::stdout(),
    )?;
    let stderr = output_method(
        args.stderr,
        config.capture.stderr_limit_bytes,
        &std::io::stderr(),
    )?;
    Ok((stdout, stderr))
}

async fn read_standard_input(args: &RunArgs) -> Result<StandardInput, ExitCode> {
    match &args.stdin {
        None => Ok(StandardInput::None),
        Some(path) if path.as_os_str() == "-" => Ok(StandardInput::Inherit),
        Some(path) => tokio::fs::read(path)
            .await
            .map(StandardInput::Bytes)
            .map_err(|e| {
                eprintln!("xspawn: cannot read {}: {e}", path.display());
                ExitCode::CLI_ARGS
            }),
    }
}

async fn execute(
    configuration: &Configuration,
    input: StandardInput,
    stdout: OutputMethod,
    stderr: OutputMethod,
) -> Result<CollectedResult, RunnerError> {
    match input {
        StandardInput::None => {
            configuration
                .collect(InputMethod::no_input(), stdout, stderr)
                .await
        }
        StandardInput::Inherit => {
            let stdin = InputMethod::read_from_borrowed(&std::io::stdin())?;
            configuration.collect(stdin, stdout, stderr).await
        }
        StandardInput::Bytes(bytes) => {
            configuration
                .collect_with_bytes(bytes, stdout, stderr)
                .await
        }
    }
}

async fn run_command(args: &RunArgs, config: &Config) -> Result<(), ExitCode> {
    let configuration = build_configuration(args, config).map_err(|reason| {
        eprintln!("xspawn: {reason}");
        ExitCode::CLI_ARGS
    })?;
    let input = read_standard_input(args).await?;
    let (stdout, stderr) = output_methods(args, config).map_err(|err| {
        eprintln!("xspawn: {err}");
        ExitCode::from(&err)
    })?;

    debug!(executable = %configuration.executable(), "starting run");
    let outcome = tokio::select! {
        outcome = execute(&configuration, input, stdout, stderr) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling run");
            return Err(ExitCode::INTERRUPTED);
        }
    };

    let result = outcome.map_err(|err| {
        error!(error = %err, "run failed");
        eprintln!("xspawn: {err}");
        ExitCode::from(&err)
    })?;

    if result.stdout_truncated {
        warn!(
            limit = config.capture.stdout_limit_bytes,
            "standard output exceeded the capture limit and was truncated"
        );
    }
    if result.stderr_truncated {
        warn!(
            limit = config.capture.stderr_limit_bytes,
            "standard error exceeded the capture limit and was truncated"
        );
    }

    if args.json {
        let report = RunReport::from(&result);
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("xspawn: failed to serialize result: {e}");
                return Err(ExitCode::FAILURE);
            }
        }
    } else {
        mirror_output(&result);
    }

    match ExitCode::from(result.termination_status) {
        ExitCode::SUCCESS => Ok(()),
        code => Err(code),
    }
}

fn mirror_output(result: &CollectedResult) {
    if let Some(bytes) = &result.standard_output {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(bytes).and_then(|()| stdout.flush()) {
            warn!(error = %e, "failed to write captured standard output");
        }
    }
    if let Some(bytes) = &result.standard_error {
        let mut stderr = std::io::stderr().lock();
        if let Err(e) = stderr.write_all(bytes) {
            warn!(error = %e, "failed to write captured standard error");
        }
    }
}

fn print_config(config: &Config, json: bool) -> Result<(), ExitCode> {
    let effective = config.effective_config();

    if json {
        let map: serde_json::Map<String, serde_json::Value> = effective
            .into_iter()
            .map(|(key, value, source)| {
                (
                    key,
                    serde_json::json!({ "value": value, "source": source.to_string() }),
                )
            })
            .collect();
        match serde_json::to_string_pretty(&map) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("xspawn: failed to serialize configuration: {e}");
                return Err(ExitCode::FAILURE);
            }
        }
    } else {
        println!("Effective configuration:");
        for (key, value, source) in effective {
            println!("  {key:<22} {value:<12} ({source})");
        }
    }

    Ok(())
}

/// Run the CLI. Handles all output including errors; the caller only maps the
/// returned code to the process exit status.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();
    let cli_args = build_cli_args(&cli);

    let config = match Config::discover(&cli_args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("xspawn: configuration error: {err:#}");
            return Err(ExitCode::CLI_ARGS);
        }
    };

    if let Err(e) = logging::init_tracing(config.logging.verbose, config.logging.json) {
        eprintln!("xspawn: failed to initialize logging: {e}");
    }

    match &cli.command {
        Commands::Config { json } => print_config(&config, *json),
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    eprintln!("xspawn: failed to start async runtime: {e}");
                    ExitCode::FAILURE
                })?;
            runtime.block_on(run_command(args, &config))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn run_args(cli: &Cli) -> &RunArgs {
        match &cli.command {
            Commands::Run(run) => run,
            Commands::Config { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_run_with_trailing_args() {
        let cli = parse(&["xspawn", "run", "--", "ls", "-la", "--color=never"]);
        let run = run_args(&cli);
        assert_eq!(run.command, vec!["ls", "-la", "--color=never"]);
        assert_eq!(run.stdout, StreamMode::Collect);
        assert_eq!(run.stderr, StreamMode::Collect);
    }

    #[test]
    fn test_parse_env_pairs() {
        let cli = parse(&[
            "xspawn", "run", "--env", "A=1", "--env", "B=x=y", "--", "env",
        ]);
        let run = run_args(&cli);
        assert_eq!(
            run.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
    }

    #[test]
    fn test_env_pair_without_equals_is_rejected() {
        assert!(parse_env_pair("NOVALUE").is_err());
        assert!(parse_env_pair("=value").is_err());
        assert_eq!(
            parse_env_pair("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
    }

    #[test]
    fn test_run_requires_a_program() {
        assert!(Cli::try_parse_from(["xspawn", "run"]).is_err());
    }

    #[test]
    fn test_cli_args_leave_unset_flags_empty() {
        let cli = parse(&["xspawn", "run", "--", "true"]);
        let args = build_cli_args(&cli);
        assert!(args.stdout_limit_bytes.is_none());
        assert!(args.create_process_group.is_none());
        assert!(args.verbose.is_none());
        assert!(args.working_directory.is_none());
    }

    #[test]
    fn test_cli_args_carry_run_flags() {
        let cli = parse(&[
            "xspawn",
            "--verbose",
            "run",
            "--stdout-limit",
            "10",
            "--no-process-group",
            "--cwd",
            "/tmp",
            "--",
            "true",
        ]);
        let args = build_cli_args(&cli);
        assert_eq!(args.stdout_limit_bytes, Some(10));
        assert_eq!(args.create_process_group, Some(false));
        assert_eq!(args.verbose, Some(true));
        assert_eq!(args.working_directory, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_build_configuration_named_and_path() {
        let config = Config::default();

        let cli = parse(&["xspawn", "run", "--", "echo", "hi"]);
        let configuration = build_configuration(run_args(&cli), &config).unwrap();
        assert_eq!(configuration.executable(), &Executable::named("echo"));
        assert_eq!(configuration.arguments().len(), 1);

        let cli = parse(&["xspawn", "run", "--argv0", "custom", "--", "/bin/echo"]);
        let configuration = build_configuration(run_args(&cli), &config).unwrap();
        assert_eq!(configuration.executable(), &Executable::at("/bin/echo"));
        assert_eq!(
            configuration
                .arguments()
                .executable_path_override()
                .map(StringOrRawBytes::as_bytes),
            Some(b"custom".as_slice())
        );
    }

    #[test]
    fn test_build_configuration_environment() {
        let config = Config::default();
        let cli = parse(&["xspawn", "run", "--clear-env", "--env", "K=V", "--", "env"]);
        let configuration = build_configuration(run_args(&cli), &config).unwrap();
        assert!(matches!(configuration.environment(), Environment::Custom(_)));
        assert_eq!(configuration.environment().entries().len(), 1);
    }

    #[tokio::test]
    async fn test_run_report_from_collected_result() {
        let result = Configuration::new(Executable::named("echo"))
            .with_arguments(["report"])
            .collect(
                InputMethod::no_input(),
                OutputMethod::collect(),
                OutputMethod::discard(),
            )
            .await
            .unwrap();

        let report = RunReport::from(&result);
        assert!(report.success);
        assert_eq!(report.stdout.as_deref(), Some("report\n"));
        assert!(report.stderr.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["termination_status"]["kind"], "exited");
        assert!(json.get("stderr").is_none());
    }

    #[test]
    fn test_inherited_stream_is_a_duplicate() {
        let file = tempfile::tempfile().unwrap();
        let method = output_method(StreamMode::Inherit, 16, &file).unwrap();
        drop(file);
        match method {
            OutputMethod::WriteTo(descriptor) => assert!(!descriptor.close_when_done()),
            other => panic!("unexpected method: {other:?}"),
        }
        assert!(matches!(
            output_method(StreamMode::Collect, 16, &std::io::stdout()).unwrap(),
            OutputMethod::Collect { limit: 16 }
        ));
    }
}
