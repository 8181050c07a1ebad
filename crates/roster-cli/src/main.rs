use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

// `#[zbus::proxy]` generates `KioskProxy` (async) and `KioskProxyBlocking`;
// only the async variant is used here.
#[zbus::proxy(
    interface = "org.roster.Kiosk1",
    default_service = "org.roster.Kiosk1",
    default_path = "/org/roster/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn register_employee(
        &self,
        name: &str,
        email: &str,
        position: &str,
        department: &str,
    ) -> zbus::Result<String>;
    async fn list_employees(&self) -> zbus::Result<String>;
    async fn get_employee(&self, id: &str) -> zbus::Result<String>;
    async fn capture_pose(&self, employee_id: &str, pose: &str) -> zbus::Result<String>;
    async fn save_enrollment(&self, employee_id: &str) -> zbus::Result<String>;
    async fn reset_enrollment(&self, employee_id: &str) -> zbus::Result<String>;
    async fn start_kiosk(&self) -> zbus::Result<String>;
    async fn stop_kiosk(&self) -> zbus::Result<String>;
    async fn next_event(&self, timeout_secs: u32) -> zbus::Result<String>;
    async fn confirm(&self, proposal_id: &str) -> zbus::Result<String>;
    async fn snapshot(&self, proposal_id: &str) -> zbus::Result<Vec<u8>>;
    async fn cancel(&self, proposal_id: &str) -> zbus::Result<String>;
    async fn report(&self, date: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "roster", about = "Face-recognition attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Manage employees
    #[command(subcommand)]
    Employee(EmployeeCommand),
    /// Capture the five enrollment poses for an employee
    Enroll {
        /// Employee ID
        id: String,
    },
    /// Run the check-in kiosk
    Kiosk {
        /// Directory for the frames shown with each proposal
        /// (default: $XDG_RUNTIME_DIR/roster or the temp dir)
        #[arg(long)]
        snapshots: Option<PathBuf>,
    },
    /// Show attendance for a day
    Report {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<chrono::NaiveDate>,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Camera device or still-image directory
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured frame
        #[arg(short, long, default_value = "roster-test.jpg")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum EmployeeCommand {
    /// Register a new employee
    Add(NewEmployeeArgs),
    /// List employees
    List,
    /// Show one employee
    Show {
        /// Employee ID
        id: String,
    },
}

#[derive(Args)]
struct NewEmployeeArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    position: String,
    #[arg(long)]
    department: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Test { device, output } => camera_test(&device, &output),
        command => run(command, cli.session).await,
    }
}

async fn run(command: Commands, session: bool) -> Result<()> {
    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = KioskProxy::new(&connection)
        .await
        .context("rosterd is not reachable")?;

    tracing::debug!(unique_name = ?connection.unique_name(), "connected to bus");

    match command {
        Commands::Status => {
            let status = parse(proxy.status().await?)?;
            println!("rosterd {}", status["version"].as_str().unwrap_or("?"));
            println!("  camera:      {}", text(&status["camera"]));
            println!("  detector:    {}", text(&status["models"]["detector"]));
            println!("  recognizer:  {}", text(&status["models"]["recognizer"]));
            println!(
                "  store:       {} ({}, {} employees)",
                text(&status["store"]["path"]),
                if status["store"]["connected"] == true { "connected" } else { "unreachable" },
                status["store"]["employees"]
            );
            println!("  kiosk:       {}", text(&status["kiosk"]));
        }
        Commands::Employee(EmployeeCommand::Add(args)) => {
            let employee = parse(
                proxy
                    .register_employee(&args.name, &args.email, &args.position, &args.department)
                    .await?,
            )?;
            println!("Registered {} ({})", text(&employee["name"]), text(&employee["id"]));
            println!("Next: roster enroll {}", text(&employee["id"]));
        }
        Commands::Employee(EmployeeCommand::List) => {
            let employees = parse(proxy.list_employees().await?)?;
            let employees = employees.as_array().cloned().unwrap_or_default();
            if employees.is_empty() {
                println!("No employees registered");
            }
            for e in &employees {
                println!(
                    "{}  {:<24} {:<28} {:<16} {:<16} {}",
                    text(&e["id"]),
                    text(&e["name"]),
                    text(&e["email"]),
                    text(&e["position"]),
                    text(&e["department"]),
                    if e["enrolled"] == true { "enrolled" } else { "not enrolled" },
                );
            }
        }
        Commands::Employee(EmployeeCommand::Show { id }) => {
            let detail = parse(proxy.get_employee(&id).await?)?;
            let e = &detail["employee"];
            println!("{} <{}>", text(&e["name"]), text(&e["email"]));
            println!("  id:          {}", text(&e["id"]));
            println!("  position:    {}", text(&e["position"]));
            println!("  department:  {}", text(&e["department"]));
            println!("  registered:  {}", text(&e["created_at"]));
            println!(
                "  face data:   {}",
                if e["enrolled"] == true { "enrolled" } else { "not enrolled" }
            );
            let poses: Vec<&str> = detail["poses"]
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !poses.is_empty() {
                println!("  poses:       {}", poses.join(", "));
            }
        }
        Commands::Enroll { id } => enroll(&proxy, &id).await?,
        Commands::Kiosk { snapshots } => {
            let dir = snapshots.unwrap_or_else(default_snapshot_dir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
            kiosk(&proxy, &dir).await?
        }
        Commands::Report { date } => {
            let date = date.map(|d| d.to_string()).unwrap_or_default();
            let report = parse(proxy.report(&date).await?)?;
            print_report(&report);
        }
        Commands::Test { device, output } => camera_test(&device, &output)?,
    }

    Ok(())
}

/// Walk the operator through the five poses, retaking rejected captures.
async fn enroll(proxy: &KioskProxy<'_>, id: &str) -> Result<()> {
    let employee = parse(proxy.get_employee(id).await?)?;
    println!("Enrolling {}", text(&employee["employee"]["name"]));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let reset = parse(proxy.reset_enrollment(id).await?)?;
    let mut pose = reset["next_pose"].as_str().unwrap_or("front").to_string();
    let mut instruction = text(&reset["instruction"]);

    loop {
        println!("\n[{pose}] Please {instruction}, then press Enter");
        if stdin.next_line().await?.is_none() {
            bail!("input closed");
        }

        let outcome = parse(proxy.capture_pose(id, &pose).await?)?;
        if outcome["accepted"] != true {
            println!("  rejected: {}", text(&outcome["message"]));
            continue;
        }
        println!("  ok");

        match outcome["next_pose"].as_str() {
            Some(next) => {
                pose = next.to_string();
                instruction = text(&outcome["instruction"]);
            }
            None => match proxy.save_enrollment(id).await {
                Ok(_) => {
                    println!("\nFace data saved");
                    return Ok(());
                }
                Err(e) => {
                    println!("\nSave failed: {}", error_message(&e));
                    if !ask(&mut stdin, "Retake the front pose and try again?").await? {
                        bail!("enrollment not saved");
                    }
                    pose = "front".into();
                    instruction = "look straight into the camera".into();
                }
            },
        }
    }
}

/// Recognition loop with operator confirmation. Ctrl-C stops the kiosk.
async fn kiosk(proxy: &KioskProxy<'_>, snapshots: &Path) -> Result<()> {
    parse(proxy.start_kiosk().await?)?;
    println!("Kiosk running, press Ctrl-C to stop");

    let result = tokio::select! {
        r = kiosk_events(proxy, snapshots) => r,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    proxy.stop_kiosk().await?;
    println!("Kiosk stopped");
    result
}

async fn kiosk_events(proxy: &KioskProxy<'_>, snapshots: &Path) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = parse(proxy.next_event(10).await?)?;
        match event["type"].as_str() {
            Some("proposal") => {
                let p = &event["proposal"];
                let action = if p["action"] == "check_out" { "check-out" } else { "check-in" };
                println!(
                    "\n{} ({}, {}) recognized with {}% confidence",
                    text(&p["employee_name"]),
                    text(&p["position"]),
                    text(&p["department"]),
                    p["confidence"]
                );
                if p["action"] == "check_in" {
                    println!("  status: {}", text(&p["status"]));
                }
                let id = text(&p["id"]);
                match save_snapshot(proxy, &id, snapshots).await {
                    Ok(path) => println!("  frame: {}", path.display()),
                    Err(e) => println!("  frame unavailable: {e:#}"),
                }
                if ask(&mut stdin, &format!("Confirm {action}?")).await? {
                    match proxy.confirm(&id).await {
                        Ok(reply) => {
                            let outcome = parse(reply)?;
                            match outcome["outcome"].as_str() {
                                Some("checked_out") => println!(
                                    "  checked out at {} ({})",
                                    text(&outcome["time"]),
                                    text(&outcome["duration"])
                                ),
                                _ => println!(
                                    "  checked in at {} ({})",
                                    text(&outcome["time"]),
                                    text(&outcome["status"])
                                ),
                            }
                        }
                        Err(e) => println!("  failed: {}", error_message(&e)),
                    }
                } else {
                    proxy.cancel(&id).await?;
                    println!("  cancelled");
                }
            }
            Some("no_reference_data") | Some("error") => {
                println!("{}", text(&event["message"]));
            }
            Some("stopped") => return Ok(()),
            _ => {}
        }
    }
}

/// Fetch the proposal's frame and write it as `<dir>/<proposal id>.jpg`.
async fn save_snapshot(proxy: &KioskProxy<'_>, id: &str, dir: &Path) -> Result<PathBuf> {
    let jpeg = proxy.snapshot(id).await?;
    if jpeg.is_empty() {
        bail!("daemon has no frame for this proposal");
    }
    let path = snapshot_path(dir, id);
    std::fs::write(&path, &jpeg).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

fn snapshot_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.jpg"))
}

fn default_snapshot_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("roster")
}

async fn ask(stdin: &mut Lines<BufReader<Stdin>>, question: &str) -> Result<bool> {
    println!("{question} [y/N]");
    let answer = stdin.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_report(report: &Value) {
    println!("Attendance for {}", text(&report["date"]));
    let rows = report["rows"].as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        println!("No attendance records");
        return;
    }
    println!(
        "{:<24} {:<16} {:<16} {:<8} {:<8} {:<12} {}",
        "Name", "Position", "Department", "In", "Out", "Duration", "Status"
    );
    for row in &rows {
        println!(
            "{:<24} {:<16} {:<16} {:<8} {:<8} {:<12} {}",
            text(&row["employee_name"]),
            text(&row["position"]),
            text(&row["department"]),
            text(&row["check_in"]),
            text(&row["check_out"]),
            text(&row["duration"]),
            text(&row["status"]),
        );
    }
}

/// Capture one frame directly from the camera and save it as JPEG.
fn camera_test(device: &str, output: &Path) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = roster_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut source = roster_hw::open_source(device)
        .with_context(|| format!("cannot open {device}"))?;
    println!("Capturing from {}", source.describe());
    let frame = source.capture()?;
    let jpeg = frame.to_jpeg(90)?;
    std::fs::write(output, &jpeg)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "Wrote {}x{} frame to {}{}",
        frame.width(),
        frame.height(),
        output.display(),
        if frame.is_dark { " (frame is very dark)" } else { "" }
    );
    Ok(())
}

fn parse(reply: String) -> Result<Value> {
    serde_json::from_str(&reply).context("malformed reply from rosterd")
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".into(),
        other => other.to_string(),
    }
}

/// The daemon's message without the D-Bus error name prefix.
fn error_message(err: &zbus::Error) -> String {
    match err {
        zbus::Error::MethodError(_, Some(msg), _) => msg.clone(),
        other => other.to_string(),
    }
}
