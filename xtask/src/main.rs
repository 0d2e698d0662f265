use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "homeward-server";
const STORAGE_PACKAGE: &str = "homeward-storage";
const TEST_DATABASE_ENV: &str = "HOMEWARD_TEST_DATABASE_URL";
const EXPECTED_METRICS: &[&str] = &[
    "homeward_http_requests_total",
    "homeward_http_request_duration_seconds",
    "homeward_gateway_connections",
    "homeward_db_ready",
];
const EXPECTED_HEADERS: &[&str] = &[
    "x-request-id",
    "content-security-policy",
    "x-content-type-options",
    "x-frame-options",
];

type Step<'a> = (&'a str, &'a [&'a str]);
type TaskResult = Result<(), String>;

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Homeward gateway")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks, with and without `metrics`")]
    Lint,
    #[command(about = "Execute the workspace tests, with and without `metrics`")]
    Test,
    #[command(about = "Run the storage tests against HOMEWARD_TEST_DATABASE_URL")]
    TestDb,
    #[command(about = "Run lint + test")]
    Ci,
    #[command(about = "Boot a seeded gateway and check its HTTP surface and metrics")]
    Smoke,
    #[command(about = "Apply migrations to the configured database")]
    Migrate,
    #[command(about = "Run the gateway on the in-memory store with seeded demo records")]
    Demo,
}

fn main() {
    let cli = Cli::parse();
    let root = workspace_root();

    let result = match cli.command {
        Task::Fmt => run_steps(&root, &[("cargo", &["fmt", "--all"])]),
        Task::Lint => lint(&root),
        Task::Test => test(&root),
        Task::TestDb => test_db(&root),
        Task::Ci => lint(&root).and_then(|()| test(&root)),
        Task::Smoke => smoke(&root),
        Task::Migrate => run_steps(
            &root,
            &[("cargo", &["run", "-p", SERVER_PACKAGE, "--", "migrate"])],
        ),
        Task::Demo => run_steps(
            &root,
            &[("cargo", &["run", "-p", SERVER_PACKAGE, "--", "--seed-demo"])],
        ),
    };

    if let Err(err) = result {
        eprintln!("xtask failed: {err}");
        exit(1);
    }
}

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(manifest)
}

fn lint(root: &Path) -> TaskResult {
    run_steps(
        root,
        &[
            ("cargo", &["fmt", "--all", "--", "--check"]),
            ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
            (
                "cargo",
                &["clippy", "-p", SERVER_PACKAGE, "--features", "metrics", "--", "-D", "warnings"],
            ),
        ],
    )
}

fn test(root: &Path) -> TaskResult {
    run_steps(
        root,
        &[
            ("cargo", &["test", "--workspace"]),
            ("cargo", &["test", "-p", SERVER_PACKAGE, "--features", "metrics"]),
        ],
    )
}

fn test_db(root: &Path) -> TaskResult {
    if std::env::var_os(TEST_DATABASE_ENV).is_none() {
        return Err(format!("{TEST_DATABASE_ENV} must point at a disposable Postgres database"));
    }
    // Storage tests share one database.
    run_steps(
        root,
        &[("cargo", &["test", "-p", STORAGE_PACKAGE, "--", "--test-threads=1"])],
    )
}

/// Gateway process that is killed when dropped.
struct ServerProcess(Child);

impl ServerProcess {
    fn spawn(root: &Path, bind_addr: &str) -> Result<Self, String> {
        Command::new("cargo")
            .args([
                "run",
                "--quiet",
                "--features",
                "metrics",
                "-p",
                SERVER_PACKAGE,
                "--",
                "--seed-demo",
                "--bind-addr",
                bind_addr,
                "--metrics-enabled",
                "true",
            ])
            .env("RUST_LOG", "warn")
            .env_remove("HOMEWARD_SERVER__DATABASE_URL")
            .current_dir(root)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map(Self)
            .map_err(|err| format!("failed to launch {SERVER_PACKAGE}: {err}"))
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Err(err) = self.0.kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                eprintln!("failed to terminate server process: {err}");
            }
        }
        let _ = self.0.wait();
    }
}

#[derive(Deserialize)]
struct Readiness {
    status: String,
    components: Vec<Component>,
}

#[derive(Deserialize)]
struct Component {
    name: String,
    status: String,
}

#[derive(Deserialize)]
struct Version {
    version: String,
}

fn smoke(root: &Path) -> TaskResult {
    run_steps(
        root,
        &[("cargo", &["build", "--features", "metrics", "-p", SERVER_PACKAGE])],
    )?;

    let port = reserve_port().ok_or("failed to reserve a free TCP port")?;
    let base_url = format!("http://127.0.0.1:{port}");
    let _server = ServerProcess::spawn(root, &format!("127.0.0.1:{port}"))?;
    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|err| format!("failed to build HTTP client: {err}"))?;

    wait_for(&client, &format!("{base_url}/health"), Duration::from_secs(60))?;
    check_readiness(&client, &base_url)?;
    check_version(&client, &base_url)?;
    check_upgrade_refused_without_websocket(&client, &base_url)?;
    check_metrics(&client, &base_url)?;
    println!("smoke checks passed against {base_url}");
    Ok(())
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_for(client: &Client, url: &str, timeout: Duration) -> TaskResult {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    Err(format!("{url} did not respond within {}s", timeout.as_secs()))
}

fn get(client: &Client, url: &str) -> Result<Response, String> {
    client
        .get(url)
        .header("x-request-id", "xtask-smoke")
        .send()
        .map_err(|err| format!("GET {url} failed: {err}"))
}

fn expect_ok(response: Response) -> Result<Response, String> {
    if response.status() != StatusCode::OK {
        return Err(format!("{} answered {}", response.url(), response.status()));
    }
    let missing: Vec<&str> = EXPECTED_HEADERS
        .iter()
        .copied()
        .filter(|name| !response.headers().contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(format!("{} missing headers {}", response.url(), missing.join(", ")));
    }
    if response.headers()["x-request-id"] != "xtask-smoke" {
        return Err("request id was not echoed back".to_string());
    }
    Ok(response)
}

fn check_readiness(client: &Client, base_url: &str) -> TaskResult {
    let readiness: Readiness = expect_ok(get(client, &format!("{base_url}/ready"))?)?
        .json()
        .map_err(|err| format!("readiness body was not JSON: {err}"))?;
    // The smoke server runs without a database.
    if readiness.status != "degraded" {
        return Err(format!("expected degraded readiness, got {}", readiness.status));
    }
    let gateway = readiness
        .components
        .iter()
        .find(|component| component.name == "gateway")
        .ok_or("readiness is missing the gateway component")?;
    if gateway.status != "accepting" {
        return Err(format!("gateway reported {}", gateway.status));
    }
    Ok(())
}

fn check_version(client: &Client, base_url: &str) -> TaskResult {
    let version: Version = expect_ok(get(client, &format!("{base_url}/version"))?)?
        .json()
        .map_err(|err| format!("version body was not JSON: {err}"))?;
    if version.version.is_empty() {
        return Err("version is empty".to_string());
    }
    Ok(())
}

/// A plain GET on the socket route must be refused, not served.
fn check_upgrade_refused_without_websocket(client: &Client, base_url: &str) -> TaskResult {
    let status = get(client, &format!("{base_url}/socket"))?.status();
    if status.is_success() {
        return Err(format!("/socket answered {status} to a non-upgrade request"));
    }
    Ok(())
}

fn check_metrics(client: &Client, base_url: &str) -> TaskResult {
    let body = expect_ok(get(client, &format!("{base_url}/metrics"))?)?
        .text()
        .map_err(|err| format!("failed to read metrics body: {err}"))?;
    let missing: Vec<&str> = EXPECTED_METRICS
        .iter()
        .copied()
        .filter(|name| !body.contains(name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("metrics endpoint missing {}", missing.join(", ")))
    }
}

fn run_steps(root: &Path, steps: &[Step<'_>]) -> TaskResult {
    for (program, args) in steps {
        let status = Command::new(program)
            .args(*args)
            .current_dir(root)
            .status()
            .map_err(|err| format!("failed to spawn '{program}': {err}"))?;
        if !status.success() {
            return Err(format!("'{program} {}' failed with {status}", args.join(" ")));
        }
    }
    Ok(())
}
