//! Berth CLI entrypoint.
//!
//! This is the main entrypoint for the berth command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use berth::backends::{DockerCli, Kubectl};
use berth::cli::{
    Cli, Commands, CredentialCommands, LogFormat, OutputFormatter, OutputFormat, RemoteCommands,
    RunArgs,
};
use berth::config::{ConfigHasher, ConfigParser, Definition, find_config_file};
use berth::credentials::{CredentialResolver, CredentialSource};
use berth::error::{BerthError, Result};
use berth::executor::DeploymentExecutor;
use berth::manifest::ManifestBuilder;

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for definition, validation and credential errors.
const EXIT_USER_ERROR: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            exit_code(&e)
        }
    }
}

/// Initializes the logging system. Logs go to stderr so command output on
/// stdout stays machine-readable.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn exit_code(error: &BerthError) -> ExitCode {
    if error.is_user_fixable() || matches!(error, BerthError::Credential(_)) {
        ExitCode::from(EXIT_USER_ERROR)
    } else {
        ExitCode::FAILURE
    }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<ExitCode> {
    let env_name = cli.environment.as_deref();

    match &cli.command {
        Commands::Validate => cmd_validate(&Session::load(&cli)?, env_name, formatter),
        Commands::Show => cmd_show(&Session::load(&cli)?, env_name, formatter),
        Commands::Manifest { tag } => {
            cmd_manifest(&Session::load(&cli)?, env_name, tag.as_deref(), cli.output).await
        }
        Commands::Deploy { run, skip_build } => {
            cmd_deploy(&Session::load(&cli)?, env_name, run, *skip_build, formatter).await
        }
        Commands::Apply { run } => {
            cmd_deploy(&Session::load(&cli)?, env_name, run, true, formatter).await
        }
        Commands::Remote { command } => {
            cmd_remote(&Session::load(&cli)?, env_name, command, formatter).await
        }
        Commands::Credentials { command } => cmd_credentials(&cli, command, formatter),
    }
}

/// Evaluated definition plus where it came from.
struct Session {
    definition: Definition,
    root: PathBuf,
}

impl Session {
    fn load(cli: &Cli) -> Result<Self> {
        let files = definition_files(cli)?;
        let root = project_root(files.first().map(PathBuf::as_path));
        debug!("Project root: {}", root.display());

        let resolver = Arc::new(CredentialResolver::new(credential_source(cli, &root)));
        let parser = ConfigParser::new(Arc::clone(&resolver)).with_base_path(&root);
        parser.load_dotenv()?;

        // Strict mode fails on a missing key before anything else happens.
        if cli.strict_credentials {
            resolver.unlock()?;
        }

        let definition = parser.load_files(&files)?;
        Ok(Self { definition, root })
    }
}

fn definition_files(cli: &Cli) -> Result<Vec<PathBuf>> {
    if cli.config.is_empty() {
        Ok(vec![find_config_file(std::env::current_dir()?)?])
    } else {
        Ok(cli.config.clone())
    }
}

fn project_root(first_file: Option<&Path>) -> PathBuf {
    first_file
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn credential_source(cli: &Cli, root: &Path) -> CredentialSource {
    let mut source = CredentialSource::in_project(root).strict(cli.strict_credentials);
    if let Some(path) = &cli.credentials {
        source.config_path.clone_from(path);
    }
    if let Some(path) = &cli.key_path {
        source.key_path.clone_from(path);
    }
    source
}

/// Validate the definition.
fn cmd_validate(session: &Session, env_name: Option<&str>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let env = session.definition.environment(env_name)?;
    let prepared = ManifestBuilder::default().prepare(env)?;
    eprintln!("{}", formatter.format_validation(env, &prepared.warnings));
    Ok(ExitCode::SUCCESS)
}

/// Print the evaluated environment.
fn cmd_show(session: &Session, env_name: Option<&str>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let env = session.definition.environment(env_name)?;
    println!("{}", formatter.format_environment(env));
    Ok(ExitCode::SUCCESS)
}

/// Print the rendered manifest.
async fn cmd_manifest(
    session: &Session,
    env_name: Option<&str>,
    tag: Option<&str>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let env = session.definition.environment(env_name)?;
    let tag = match tag {
        Some(tag) => tag.to_string(),
        None => ConfigHasher::new().default_tag(env, &session.root)?,
    };
    let image = env.docker.image.with_tag(tag);

    let resolved = ManifestBuilder::default().build(env, &image).await?;
    match format {
        OutputFormat::Text => print!("{}", resolved.manifest.to_yaml()?),
        OutputFormat::Json => {
            let bodies: Vec<&serde_json::Value> =
                resolved.manifest.resources().iter().map(|r| &r.body).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&bodies).map_err(|e| BerthError::internal(e.to_string()))?
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Build, push and apply.
async fn cmd_deploy(
    session: &Session,
    env_name: Option<&str>,
    run: &RunArgs,
    skip_build: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let env = session.definition.environment(env_name)?;
    let executor = DeploymentExecutor::new(
        ManifestBuilder::default(),
        Arc::new(DockerCli::new()),
        Arc::new(Kubectl::new()),
    )
    .with_options(run.options(skip_build, Some(session.root.clone())));

    let cancel = executor.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight calls finish");
            cancel.cancel();
        }
    });

    let report = executor.run(env).await?;
    let output = formatter.format_report(&report);
    if report.is_success() {
        println!("{output}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{output}");
        Ok(ExitCode::FAILURE)
    }
}

/// Provider calls.
async fn cmd_remote(
    session: &Session,
    env_name: Option<&str>,
    command: &RemoteCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let env = session.definition.environment(env_name)?;
    let prepared = ManifestBuilder::default().prepare(env)?;

    match command {
        RemoteCommands::Describe => {
            let cluster = prepared.provider.describe().await?;
            println!("{}", formatter.format_cluster(&cluster));
        }
        RemoteCommands::Kubeconfig => {
            let kubeconfig = prepared.provider.kubeconfig().await?;
            print!("{}", kubeconfig.contents);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Credential store commands. These work without a definition file.
fn cmd_credentials(cli: &Cli, command: &CredentialCommands, formatter: &OutputFormatter) -> Result<ExitCode> {
    let root = match cli.config.first() {
        Some(file) => project_root(Some(file)),
        None => std::env::current_dir()
            .ok()
            .and_then(|dir| find_config_file(dir).ok())
            .map_or_else(|| PathBuf::from("."), |file| project_root(Some(&file))),
    };
    let mut source = credential_source(cli, &root);

    match command {
        CredentialCommands::Encrypt { plaintext, out } => {
            let text = std::fs::read_to_string(plaintext)?;
            if let Some(out) = out {
                source.config_path.clone_from(out);
            }
            let created = CredentialResolver::write_store(&source, &text)?;
            if created {
                eprintln!(
                    "{}",
                    formatter.warning(&format!(
                        "Generated {}. Keep it out of version control.",
                        source.key_path.display()
                    ))
                );
            }
            eprintln!(
                "{}",
                formatter.success(&format!("Wrote {}", source.config_path.display()))
            );
        }
        CredentialCommands::Keys => {
            let keys = CredentialResolver::new(source).keys()?;
            println!("{}", formatter.format_keys(&keys));
        }
    }
    Ok(ExitCode::SUCCESS)
}
