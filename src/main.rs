use capsule_run::api::{BindMount, IsolationConfig, ResourceLimits};
use capsule_run::config;
use capsule_run::error::{CapsuleError, CapsuleResult};
use capsule_run::facade::Facade;
use capsule_run::forkserver::ForkServerClient;
use capsule_run::rpc::{CallArg, TypeTag, MAX_CALL_ARGS};
use capsule_run::sandbox::PolicyBuilder;
use capsule_run::session::Session;
use capsule_run::transaction::{Transaction, TransactionError};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "capsule-run")]
#[command(about = "Calls a statically linked, seccomp-confined function under a supervised session")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Read a call request as JSON from stdin instead of using CLI arguments
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Per-attempt wall-clock timeout in milliseconds
    #[arg(long, short = 't', value_name = "MS")]
    timeout: Option<u64>,

    /// Memory limit for the sandboxee's cgroup (e.g., 256M, 1G)
    #[arg(long, short = 'm', value_name = "SIZE")]
    memory: Option<String>,

    /// CPU shares (relative weight)
    #[arg(long, value_name = "SHARES")]
    cpu: Option<u32>,

    /// Maximum number of processes in the sandboxee's pid namespace
    #[arg(long, value_name = "NUM")]
    max_pids: Option<u32>,

    /// Enable network access (disabled by default for security)
    #[arg(long, action = ArgAction::SetTrue)]
    network: bool,

    /// Working directory inside the sandbox
    #[arg(long, short = 'w', value_name = "DIR", default_value = "/workspace")]
    workdir: String,

    /// Environment variable the sandboxee starts with (can be used multiple times)
    #[arg(long, short = 'e', value_name = "KEY=VALUE", action = ArgAction::Append)]
    env: Vec<String>,

    /// Read-only directory bind mount (can be used multiple times)
    #[arg(long, value_name = "PATH", action = ArgAction::Append)]
    readonly: Vec<String>,

    /// Writable directory bind mount (can be used multiple times)
    #[arg(long, value_name = "PATH", action = ArgAction::Append)]
    writable: Vec<String>,

    /// Bind mount source:dest[:ro|rw] (can be used multiple times)
    #[arg(long, value_name = "SRC:DEST[:MODE]", action = ArgAction::Append)]
    bind: Vec<String>,

    /// Number of attempts before giving up on a transient failure
    #[arg(long, default_value_t = 1)]
    retries: u32,

    /// Try the seccomp user-notification monitor before falling back to ptrace
    #[arg(long, action = ArgAction::SetTrue)]
    unotify: bool,

    /// Pretty print JSON output
    #[arg(long, action = ArgAction::SetTrue)]
    pretty: bool,

    /// Verbose output (show debugging information)
    #[arg(long, short = 'v', action = ArgAction::SetTrue)]
    verbose: bool,

    /// Name of the statically linked function to call inside the sandbox
    #[arg(value_name = "FUNCTION")]
    call: Option<String>,

    /// Integer arguments passed to the call, up to six
    #[arg(value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<i64>,
}

/// A call request read from stdin in `--json` mode: same shape the CLI
/// arguments assemble, exposed directly for callers that already have a
/// structured request rather than argv (`SPEC_FULL.md` §6).
#[derive(Debug, Deserialize, Serialize)]
struct CallRequest {
    call: String,
    #[serde(default)]
    args: Vec<i64>,
    #[serde(default)]
    environment: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    resources: ResourceLimits,
    #[serde(default)]
    isolation: IsolationConfig,
    #[serde(default = "default_retries")]
    retries: u32,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    1
}

/// Outcome reported on stdout: the call's return value on success, or the
/// reason a [`TransactionError`] gave up, mirroring `SPEC_FULL.md` §7's error
/// taxonomy instead of a raw `Debug` dump.
#[derive(Debug, Serialize)]
struct CallOutcome {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    attempts: u32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> CapsuleResult<i32> {
    let cli = Cli::parse();
    let config = config::load_config()?;
    let use_unotify = cli.unotify || config.monitoring.unotify_enabled;
    let grace_window = Duration::from_millis(config.monitoring.grace_window_ms);

    let request = if cli.json {
        read_json_request()?
    } else {
        build_request_from_cli(&cli)?
    };

    if request.args.len() > MAX_CALL_ARGS {
        return Err(CapsuleError::InvalidArgument(format!(
            "call takes at most {} arguments, got {}",
            MAX_CALL_ARGS,
            request.args.len()
        )));
    }

    if cli.verbose {
        eprintln!("capsule-run v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("Call: {}({:?})", request.call, request.args);
        eprintln!("Timeout: {}ms, retries: {}", request.timeout_ms, request.retries);
        eprintln!("Memory limit: {} bytes", request.resources.memory_bytes);
        eprintln!("Network enabled: {}", request.isolation.network);
    }

    let rootfs_dir = format!("/tmp/capsule-run-{}", std::process::id());
    let spawn_request = build_spawn_request(&request, &rootfs_dir)?;

    let forkserver = ForkServerClient::spawn_helper(grace_window)?;
    let session = Session::new(forkserver, spawn_request, use_unotify);
    let mut transaction = Transaction::new(
        session,
        request.retries,
        Duration::from_millis(request.timeout_ms),
    );

    let call_args: Vec<CallArg> = request.args.iter().map(|a| CallArg::int(*a)).collect();
    let call_name = request.call.clone();
    let outcome = transaction.run(move |session| {
        let facade = Facade::new(session);
        facade.call(&call_name, TypeTag::Int, call_args.clone())
    });

    let exit_code = match &outcome {
        Ok(_) => 0,
        Err(TransactionError::Violation(_)) => 2,
        Err(TransactionError::Cancelled) => 3,
        Err(TransactionError::Exhausted(_)) => 1,
    };

    let report = match outcome {
        Ok(value) => CallOutcome {
            success: true,
            result: Some(value.as_i64()),
            error: None,
            attempts: transaction.attempts_made(),
        },
        Err(e) => CallOutcome {
            success: false,
            result: None,
            error: Some(e.to_string()),
            attempts: transaction.attempts_made(),
        },
    };

    let json_output = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json_output);

    Ok(exit_code)
}

fn read_json_request() -> CapsuleResult<CallRequest> {
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    let request: CallRequest = serde_json::from_str(&buffer)?;
    Ok(request)
}

fn build_request_from_cli(cli: &Cli) -> CapsuleResult<CallRequest> {
    let call = cli.call.clone().ok_or_else(|| {
        CapsuleError::Config(
            "No function specified. Use --json for JSON input or provide a FUNCTION argument.".to_string(),
        )
    })?;

    let mut environment = HashMap::new();
    for env_var in &cli.env {
        if let Some((key, value)) = env_var.split_once('=') {
            environment.insert(key.to_string(), value.to_string());
        } else {
            return Err(CapsuleError::Config(format!(
                "Invalid environment variable format: {}. Use KEY=VALUE.",
                env_var
            )));
        }
    }

    let mut bind_mounts = Vec::new();
    for bind_spec in &cli.bind {
        bind_mounts.push(parse_bind_mount(bind_spec)?);
    }

    let resources = ResourceLimits {
        memory_bytes: cli
            .memory
            .as_ref()
            .map(|s| parse_size(s))
            .transpose()?
            .unwrap_or(268_435_456),
        cpu_shares: cli.cpu.unwrap_or(1024),
        max_output_bytes: 1_048_576,
        max_pids: cli.max_pids.unwrap_or(100),
    };

    let isolation = IsolationConfig {
        network: cli.network,
        readonly_paths: cli.readonly.clone(),
        writable_paths: cli.writable.clone(),
        working_directory: cli.workdir.clone(),
        bind_mounts,
    };

    Ok(CallRequest {
        call,
        args: cli.args.clone(),
        environment,
        timeout_ms: cli.timeout.unwrap_or(30_000),
        resources,
        isolation,
        retries: cli.retries.max(1),
    })
}

/// Lowers a [`CallRequest`] into a [`capsule_run::forkserver::SpawnRequest`]
/// via [`PolicyBuilder`]. The syscall allowlist covers what the RPC
/// responder loop itself needs to read/write the channel, allocate
/// scratch buffers, and exit cleanly (`SPEC_FULL.md` §4.D/§4.J); callers
/// needing anything beyond that compose their own policy through the
/// library API directly rather than through this binary.
fn build_spawn_request(
    request: &CallRequest,
    rootfs_dir: &str,
) -> CapsuleResult<capsule_run::forkserver::SpawnRequest> {
    use capsule_run::policy::{Action, SyscallClass};

    let mut builder = PolicyBuilder::new(rootfs_dir);
    builder.with_policy(|p| {
        p.allow_unrestricted_class(SyscallClass::Read)
            .allow_unrestricted_class(SyscallClass::Write)
            .allow_unrestricted_class(SyscallClass::SystemMalloc)
            .allow_unrestricted_class(SyscallClass::Exit)
            .allow_unrestricted_class(SyscallClass::Time)
            .allow_unrestricted_class(SyscallClass::HandleSignals)
            .allow_syscall_by_name("futex")
            .allow_syscall_by_name("close")
            .default_action(Action::KillProcess)
    });

    for path in &request.isolation.readonly_paths {
        builder.add_directory(path.clone(), true);
    }
    for path in &request.isolation.writable_paths {
        builder.add_directory(path.clone(), false);
    }
    for mount in &request.isolation.bind_mounts {
        builder.add_directory_at(mount.source.clone(), mount.destination.clone(), mount.readonly);
    }

    builder.enable_network(request.isolation.network);
    builder.set_cwd(request.isolation.working_directory.clone());
    for (key, value) in &request.environment {
        builder.set_env(key, value);
    }
    builder.set_resource_limits(
        request.resources.memory_bytes,
        request.resources.cpu_shares,
        request.resources.max_pids,
    );

    builder.build()
}

fn parse_bind_mount(spec: &str) -> CapsuleResult<BindMount> {
    let parts: Vec<&str> = spec.split(':').collect();

    match parts.len() {
        2 => Ok(BindMount {
            source: parts[0].to_string(),
            destination: parts[1].to_string(),
            readonly: true,
        }),
        3 => {
            let readonly = match parts[2] {
                "ro" => true,
                "rw" => false,
                _ => {
                    return Err(CapsuleError::Config(format!(
                        "Invalid bind mount mode '{}'. Use 'ro' or 'rw'.",
                        parts[2]
                    )))
                }
            };

            Ok(BindMount {
                source: parts[0].to_string(),
                destination: parts[1].to_string(),
                readonly,
            })
        }
        _ => Err(CapsuleError::Config(format!(
            "Invalid bind mount format '{}'. Use 'source:dest' or 'source:dest:mode'.",
            spec
        ))),
    }
}

fn parse_size(size_str: &str) -> CapsuleResult<u64> {
    let size_str = size_str.trim().to_uppercase();

    if let Some(number_part) = size_str.strip_suffix('K') {
        let number: u64 = number_part
            .parse()
            .map_err(|_| CapsuleError::Config(format!("Invalid size format: {}", size_str)))?;
        Ok(number * 1024)
    } else if let Some(number_part) = size_str.strip_suffix('M') {
        let number: u64 = number_part
            .parse()
            .map_err(|_| CapsuleError::Config(format!("Invalid size format: {}", size_str)))?;
        Ok(number * 1024 * 1024)
    } else if let Some(number_part) = size_str.strip_suffix('G') {
        let number: u64 = number_part
            .parse()
            .map_err(|_| CapsuleError::Config(format!("Invalid size format: {}", size_str)))?;
        Ok(number * 1024 * 1024 * 1024)
    } else {
        size_str
            .parse()
            .map_err(|_| CapsuleError::Config(format!("Invalid size format: {}", size_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("256m").unwrap(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_parse_bind_mount() {
        let bind = parse_bind_mount("/host/path:/container/path").unwrap();
        assert_eq!(bind.source, "/host/path");
        assert_eq!(bind.destination, "/container/path");
        assert!(bind.readonly);

        let bind = parse_bind_mount("/host/path:/container/path:rw").unwrap();
        assert_eq!(bind.source, "/host/path");
        assert_eq!(bind.destination, "/container/path");
        assert!(!bind.readonly);

        let bind = parse_bind_mount("/host/path:/container/path:ro").unwrap();
        assert!(bind.readonly);

        assert!(parse_bind_mount("/invalid").is_err());
        assert!(parse_bind_mount("/a:/b:/c:/d").is_err());
        assert!(parse_bind_mount("/a:/b:invalid").is_err());
    }

    #[test]
    fn test_cli_parsing() {
        use clap::Parser;

        let cli = Cli::try_parse_from([
            "capsule-run",
            "--timeout",
            "5000",
            "--memory",
            "512M",
            "--env",
            "PATH=/usr/bin",
            "--env",
            "HOME=/tmp",
            "--readonly",
            "/usr",
            "sum",
            "1",
            "2",
        ])
        .unwrap();

        assert_eq!(cli.timeout, Some(5000));
        assert_eq!(cli.memory, Some("512M".to_string()));
        assert_eq!(cli.env, vec!["PATH=/usr/bin", "HOME=/tmp"]);
        assert_eq!(cli.readonly, vec!["/usr"]);
        assert_eq!(cli.call, Some("sum".to_string()));
        assert_eq!(cli.args, vec![1, 2]);
    }

    #[test]
    fn build_request_from_cli_requires_a_call_name() {
        let cli = Cli::try_parse_from(["capsule-run"]).unwrap();
        let err = build_request_from_cli(&cli).unwrap_err();
        assert!(matches!(err, CapsuleError::Config(_)));
    }
}
