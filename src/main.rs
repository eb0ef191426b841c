use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nix::unistd::mkfifo;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::symlink;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(version, about = "lsr golden-output regression harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the golden suite (default)
    Run {
        /// Which build of lsr to test
        #[arg(value_enum, default_value_t = BuildMode::Release)]
        mode: BuildMode,
        /// Only run cases whose id contains this filter
        #[arg(short, long)]
        filter: Option<String>,
        /// Print per-case execution details
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
        /// Run every case instead of stopping at the first failure
        #[arg(long, default_value_t = false)]
        keep_going: bool,
        /// Worker threads; only honoured together with --keep-going
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        /// Per-case timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Golden fixture directory (defaults to fixtures/ next to the harness)
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Explicit path to the lsr binary, overriding the mode lookup
        #[arg(long)]
        binary: Option<PathBuf>,
    },
    /// Re-record every golden fixture from the current binary's output
    Regen {
        /// Which build of lsr to record from
        #[arg(value_enum, default_value_t = BuildMode::Release)]
        mode: BuildMode,
        /// Only record fixtures for cases whose id contains this filter
        #[arg(short, long)]
        filter: Option<String>,
        /// Golden fixture directory (defaults to fixtures/ next to the harness)
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Explicit path to the lsr binary, overriding the mode lookup
        #[arg(long)]
        binary: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BuildMode {
    Release,
    Debug,
}

impl BuildMode {
    fn profile(self) -> &'static str {
        match self {
            BuildMode::Release => "release",
            BuildMode::Debug => "debug",
        }
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.profile())
    }
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        mode: BuildMode::Release,
        filter: None,
        verbose: false,
        keep_going: false,
        jobs: 1,
        timeout: 30,
        fixtures: None,
        binary: None,
    });

    match command {
        Commands::Run {
            mode,
            filter,
            verbose,
            keep_going,
            jobs,
            timeout,
            fixtures,
            binary,
        } => {
            VERBOSE.store(verbose, Ordering::Relaxed);
            run_suite(
                mode,
                filter,
                keep_going,
                jobs,
                Duration::from_secs(timeout),
                fixtures,
                binary,
            )
        }
        Commands::Regen {
            mode,
            filter,
            fixtures,
            binary,
        } => regen(mode, filter, fixtures, binary),
    }
}

// --------------------- Case model ------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ColourMode {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExitClass {
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareMode {
    /// Golden bytes are checked against captured stdout only.
    StdoutOnly,
    /// stdout and stderr share one file description during capture, so the
    /// golden bytes see the true interleaving. Only defined for cases where
    /// lsr orders its streams deterministically (diagnostics are flushed
    /// before any listing output).
    Merged,
}

/// Per-case environment configuration for the child process. Everything here
/// materializes as a child-only environment delta; the harness never touches
/// its own environment, so cases cannot leak settings into each other.
#[derive(Clone, Debug, Default)]
struct EnvSpec {
    terminal_width: Option<u32>,
    locale: Option<String>,
    strict: bool,
    debug: bool,
    colour: ColourMode,
}

/// Exact changes to apply to the child environment: values to set, plus
/// controlled variables to actively remove so nothing inherited by the
/// harness process can reach a case that left them unset.
struct EnvDelta {
    set: Vec<(&'static str, String)>,
    unset: Vec<&'static str>,
}

const CONTROLLED_VARS: [&str; 6] = ["COLUMNS", "LC_ALL", "LANG", "LSR_STRICT", "LSR_DEBUG", "TZ"];

impl EnvSpec {
    fn delta(&self) -> EnvDelta {
        let mut set: Vec<(&'static str, String)> = vec![("TZ", "UTC".to_string())];
        if let Some(width) = self.terminal_width {
            set.push(("COLUMNS", width.to_string()));
        }
        if let Some(locale) = &self.locale {
            set.push(("LC_ALL", locale.clone()));
            set.push(("LANG", locale.clone()));
        }
        if self.strict {
            set.push(("LSR_STRICT", "1".to_string()));
        }
        if self.debug {
            set.push(("LSR_DEBUG", "1".to_string()));
        }
        let unset = CONTROLLED_VARS
            .iter()
            .copied()
            .filter(|name| set.iter().all(|(key, _)| key != name))
            .collect();
        EnvDelta { set, unset }
    }

    /// Colour selection is an argv concern of lsr, not a variable; `Auto`
    /// emits nothing, mirroring how an unset width emits no COLUMNS.
    fn colour_flag(&self) -> Option<String> {
        match self.colour {
            ColourMode::Auto => None,
            ColourMode::Always => Some("--colour=always".to_string()),
            ColourMode::Never => Some("--colour=never".to_string()),
        }
    }
}

#[derive(Clone, Debug)]
struct TestCase {
    id: String,
    args: Vec<String>,
    /// Paths relative to the scratch tree root, appended after the flags.
    targets: Vec<String>,
    env: EnvSpec,
    fixture: String,
    mode: CompareMode,
    exit: ExitClass,
    run_as: Option<String>,
}

fn case(id: &str, args: &[&str]) -> TestCase {
    TestCase {
        id: id.to_string(),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        targets: Vec::new(),
        env: EnvSpec::default(),
        fixture: id.replace([' ', '-'], "_"),
        mode: CompareMode::StdoutOnly,
        exit: ExitClass::Success,
        run_as: None,
    }
}

impl TestCase {
    fn target(mut self, path: &str) -> Self {
        self.targets.push(path.to_string());
        self
    }

    fn width(mut self, columns: u32) -> Self {
        self.env.terminal_width = Some(columns);
        self
    }

    fn locale(mut self, locale: &str) -> Self {
        self.env.locale = Some(locale.to_string());
        self
    }

    fn strict(mut self) -> Self {
        self.env.strict = true;
        self
    }

    fn debug(mut self) -> Self {
        self.env.debug = true;
        self
    }

    fn colour(mut self, mode: ColourMode) -> Self {
        self.env.colour = mode;
        self
    }

    fn merged(mut self) -> Self {
        self.mode = CompareMode::Merged;
        self
    }

    fn fails(mut self) -> Self {
        self.exit = ExitClass::Failure;
        self
    }

    fn fixture(mut self, id: &str) -> Self {
        self.fixture = id.to_string();
        self
    }

    fn as_user(mut self, user: &str) -> Self {
        self.run_as = Some(user.to_string());
        self
    }
}

// --------------------- Invoker ---------------------------------------------

#[derive(Debug, Error)]
enum ExecutionError {
    #[error("target binary missing at {0:?}")]
    BinaryMissing(PathBuf),
    #[error("spawn denied for {0:?}")]
    SpawnDenied(PathBuf),
    #[error("privilege elevation to '{user}' failed: {detail}")]
    Elevation { user: String, detail: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct ExecutionResult {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    wall: Duration,
}

impl ExecutionResult {
    /// Bytes the comparator looks at. A merged capture lands in `stdout`
    /// (both streams wrote through one file description), so both compare
    /// modes read the same field.
    fn observed(&self) -> &[u8] {
        &self.stdout
    }
}

struct Invocation<'a> {
    binary: &'a Path,
    sudo: Option<&'a Path>,
    args: &'a [String],
    delta: &'a EnvDelta,
    cwd: &'a Path,
    run_as: Option<&'a str>,
    merged: bool,
    timeout: Duration,
}

fn execute(inv: &Invocation) -> Result<ExecutionResult, ExecutionError> {
    if !inv.binary.exists() {
        return Err(ExecutionError::BinaryMissing(inv.binary.to_path_buf()));
    }
    let mut command = match inv.run_as {
        Some(user) => {
            let sudo = inv.sudo.ok_or_else(|| ExecutionError::Elevation {
                user: user.to_string(),
                detail: "sudo not found".to_string(),
            })?;
            let mut command = Command::new(sudo);
            command.args(["-n", "-u", user, "--"]).arg(inv.binary);
            command
        }
        None => Command::new(inv.binary),
    };
    command
        .args(inv.args)
        .current_dir(inv.cwd)
        .stdin(Stdio::null());
    for name in &inv.delta.unset {
        command.env_remove(name);
    }
    for (name, value) in &inv.delta.set {
        command.env(name, value);
    }

    let mut capture = None;
    if inv.merged {
        let file = tempfile::tempfile()?;
        command.stdout(Stdio::from(file.try_clone()?));
        command.stderr(Stdio::from(file.try_clone()?));
        capture = Some(file);
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => ExecutionError::BinaryMissing(inv.binary.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => {
            ExecutionError::SpawnDenied(inv.binary.to_path_buf())
        }
        _ => ExecutionError::Io(err),
    })?;

    // Drain both pipes off-thread so a full pipe buffer can never deadlock
    // the child against our wait loop.
    let stdout_reader = child.stdout.take().map(drain_thread);
    let stderr_reader = child.stderr.take().map(drain_thread);

    let deadline = started + inv.timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(reader) = stdout_reader {
                let _ = reader.join();
            }
            if let Some(reader) = stderr_reader {
                let _ = reader.join();
            }
            return Err(ExecutionError::Timeout(inv.timeout));
        }
        thread::sleep(Duration::from_millis(5));
    };
    let wall = started.elapsed();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(reader) = stdout_reader {
        stdout = reader.join().unwrap()?;
    }
    if let Some(reader) = stderr_reader {
        stderr = reader.join().unwrap()?;
    }
    if let Some(mut file) = capture {
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut stdout)?;
    }

    // A death by signal is the child's result, not a harness crash.
    let exit_code = status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));

    // sudo's own refusal (password required, unknown user) comes back as a
    // nonzero exit with a "sudo:" diagnostic; surface that as an elevation
    // error rather than a target failure.
    if let Some(user) = inv.run_as {
        let diagnostic = if inv.merged { &stdout } else { &stderr };
        if exit_code != 0 && diagnostic.starts_with(b"sudo:") {
            return Err(ExecutionError::Elevation {
                user: user.to_string(),
                detail: String::from_utf8_lossy(diagnostic)
                    .lines()
                    .next()
                    .unwrap_or("")
                    .to_string(),
            });
        }
    }

    if VERBOSE.load(Ordering::Relaxed) {
        println!(
            "[CMD ] {:?} {:?} -> status {}, stdout {}B, stderr {}B in {:?}",
            inv.binary,
            inv.args,
            exit_code,
            stdout.len(),
            stderr.len(),
            wall
        );
    }
    Ok(ExecutionResult {
        stdout,
        stderr,
        exit_code,
        wall,
    })
}

fn drain_thread<R: Read + Send + 'static>(
    mut stream: R,
) -> thread::JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer)?;
        Ok(buffer)
    })
}

// --------------------- Fixture store ---------------------------------------

#[derive(Debug, Error)]
enum FixtureError {
    #[error("no golden fixture named '{0}'")]
    NotFound(String),
    #[error("fixture root {0:?} is not a directory")]
    UnreadableRoot(PathBuf),
}

/// The golden corpus, loaded once at startup and immutable afterwards.
/// Fixture ids are paths relative to the root; contents are opaque bytes.
struct FixtureSet {
    entries: BTreeMap<String, Vec<u8>>,
}

impl FixtureSet {
    fn load(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!(FixtureError::UnreadableRoot(root.to_path_buf()));
        }
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let id = entry
                .path()
                .strip_prefix(root)?
                .to_string_lossy()
                .into_owned();
            let bytes = fs::read(entry.path())
                .with_context(|| format!("reading golden fixture {:?}", entry.path()))?;
            entries.insert(id, bytes);
        }
        Ok(Self { entries })
    }

    fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, id: &str) -> Result<&[u8], FixtureError> {
        self.entries
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| FixtureError::NotFound(id.to_string()))
    }
}

// --------------------- Comparator ------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum ComparisonOutcome {
    Equal,
    Different { offset: usize },
}

fn compare(observed: &[u8], golden: &[u8]) -> ComparisonOutcome {
    match first_divergence(observed, golden) {
        None => ComparisonOutcome::Equal,
        Some(offset) => ComparisonOutcome::Different { offset },
    }
}

fn first_divergence(observed: &[u8], golden: &[u8]) -> Option<usize> {
    let shared = observed.len().min(golden.len());
    for offset in 0..shared {
        if observed[offset] != golden[offset] {
            return Some(offset);
        }
    }
    if observed.len() != golden.len() {
        return Some(shared);
    }
    None
}

fn divergence_reason(observed: &[u8], golden: &[u8], offset: usize, fixture: &str) -> String {
    let describe = |bytes: &[u8]| match bytes.get(offset) {
        Some(byte) => format!("0x{byte:02x}"),
        None => "end of stream".to_string(),
    };
    format!(
        "diverges from golden '{fixture}' at byte {offset} (expected {}, got {}; output {}B, golden {}B)",
        describe(golden),
        describe(observed),
        observed.len(),
        golden.len()
    )
}

// --------------------- Case runner -----------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum Outcome {
    Pass,
    Fail(String),
    Skipped(String),
}

struct Runner {
    binary: PathBuf,
    sudo: Option<PathBuf>,
    fixtures: FixtureSet,
    tree_root: PathBuf,
    timeout: Duration,
    /// Users the preflight probe confirmed we can become.
    elevation: BTreeSet<String>,
}

impl Runner {
    fn capture_case(&self, case: &TestCase) -> Result<ExecutionResult, ExecutionError> {
        let mut args = Vec::new();
        if let Some(flag) = case.env.colour_flag() {
            args.push(flag);
        }
        args.extend(case.args.iter().cloned());
        args.extend(case.targets.iter().cloned());
        let delta = case.env.delta();
        execute(&Invocation {
            binary: &self.binary,
            sudo: self.sudo.as_deref(),
            args: &args,
            delta: &delta,
            cwd: &self.tree_root,
            run_as: case.run_as.as_deref(),
            merged: case.mode == CompareMode::Merged,
            timeout: self.timeout,
        })
    }

    fn run_case(&self, case: &TestCase) -> Outcome {
        if let Some(user) = &case.run_as {
            if !self.elevation.contains(user) {
                return Outcome::Skipped("privilege elevation unavailable".to_string());
            }
        }
        let golden = match self.fixtures.get(&case.fixture) {
            Ok(bytes) => bytes,
            Err(err) => return Outcome::Fail(err.to_string()),
        };
        let result = match self.capture_case(case) {
            Ok(result) => result,
            Err(ExecutionError::Timeout(limit)) => {
                return Outcome::Fail(format!("timeout after {limit:?}"))
            }
            Err(err) => return Outcome::Fail(err.to_string()),
        };
        let exited_clean = result.exit_code == 0;
        if exited_clean != (case.exit == ExitClass::Success) {
            return Outcome::Fail(format!(
                "unexpected exit code {} after {:?} (stderr: {})",
                result.exit_code,
                result.wall,
                String::from_utf8_lossy(&result.stderr).trim()
            ));
        }
        match compare(result.observed(), golden) {
            ComparisonOutcome::Equal => Outcome::Pass,
            ComparisonOutcome::Different { offset } => Outcome::Fail(divergence_reason(
                result.observed(),
                golden,
                offset,
                &case.fixture,
            )),
        }
    }
}

// --------------------- Suite orchestrator ----------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Policy {
    FailFast,
    KeepGoing,
}

struct SuiteReport {
    entries: Vec<(String, Outcome)>,
}

impl SuiteReport {
    fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Pass))
    }

    fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Fail(_)))
    }

    fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|(_, outcome)| pred(outcome)).count()
    }
}

fn run_all(runner: &Runner, cases: &[TestCase], policy: Policy, jobs: usize) -> SuiteReport {
    // Fail-fast stays sequential so "first failure" is well defined and the
    // diagnostic output keeps declaration order.
    let jobs = if policy == Policy::FailFast { 1 } else { jobs.max(1) };
    if jobs == 1 {
        run_sequential(runner, cases, policy)
    } else {
        run_pooled(runner, cases, jobs)
    }
}

fn run_sequential(runner: &Runner, cases: &[TestCase], policy: Policy) -> SuiteReport {
    let mut entries = Vec::with_capacity(cases.len());
    let mut aborted = false;
    for case in cases {
        if aborted {
            entries.push((
                case.id.clone(),
                Outcome::Skipped("fail-fast abort".to_string()),
            ));
            continue;
        }
        if VERBOSE.load(Ordering::Relaxed) {
            println!("[RUN ] {}", case.id);
        }
        let outcome = runner.run_case(case);
        announce(&case.id, &outcome);
        if policy == Policy::FailFast && matches!(outcome, Outcome::Fail(_)) {
            aborted = true;
        }
        entries.push((case.id.clone(), outcome));
    }
    SuiteReport { entries }
}

fn run_pooled(runner: &Runner, cases: &[TestCase], jobs: usize) -> SuiteReport {
    let cursor = AtomicUsize::new(0);
    let slots: Vec<OnceLock<Outcome>> = (0..cases.len()).map(|_| OnceLock::new()).collect();
    thread::scope(|scope| {
        for _ in 0..jobs.min(cases.len()) {
            scope.spawn(|| loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(case) = cases.get(index) else { break };
                let outcome = runner.run_case(case);
                announce(&case.id, &outcome);
                let _ = slots[index].set(outcome);
            });
        }
    });
    // Outcomes are slot-addressed, so the report keeps declaration order no
    // matter which worker finished first.
    let entries = cases
        .iter()
        .zip(slots)
        .map(|(case, slot)| {
            let outcome = slot
                .into_inner()
                .unwrap_or_else(|| Outcome::Fail("worker never reported".to_string()));
            (case.id.clone(), outcome)
        })
        .collect();
    SuiteReport { entries }
}

fn announce(id: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Pass => println!("[PASS] {id}"),
        Outcome::Fail(reason) => println!("[FAIL] {id}: {reason}"),
        Outcome::Skipped(reason) => println!("[SKIP] {id}: {reason}"),
    }
}

// --------------------- Preflight -------------------------------------------

#[derive(Debug, Error)]
enum PreflightError {
    #[error(
        "lsr binary not found at {0:?}; build it first (`cargo build --release`) or pass --binary"
    )]
    BinaryMissing(PathBuf),
}

#[derive(Debug)]
struct Preflight {
    warnings: Vec<String>,
    elevation: BTreeSet<String>,
}

const STALENESS_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn preflight(
    binary: &Path,
    fixture_root: &Path,
    users: &BTreeSet<String>,
    sudo: Option<&Path>,
) -> Result<Preflight> {
    if !binary.is_file() {
        bail!(PreflightError::BinaryMissing(binary.to_path_buf()));
    }
    let mut warnings = Vec::new();
    let now = SystemTime::now();
    for entry in WalkDir::new(fixture_root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = match entry.metadata().ok().and_then(|meta| meta.modified().ok()) {
            Some(modified) => modified,
            None => continue,
        };
        if now.duration_since(modified).unwrap_or_default() > STALENESS_LIMIT {
            warnings.push(format!(
                "golden fixture {:?} is over a year old; date columns have likely drifted (re-run `lsr-tests regen`)",
                entry.path()
            ));
        }
    }
    let mut elevation = BTreeSet::new();
    for user in users {
        if can_elevate(sudo, user) {
            elevation.insert(user.clone());
        }
    }
    Ok(Preflight {
        warnings,
        elevation,
    })
}

fn can_elevate(sudo: Option<&Path>, user: &str) -> bool {
    let Some(sudo) = sudo else { return false };
    Command::new(sudo)
        .args(["-n", "-u", user, "--", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

// --------------------- Scratch tree ----------------------------------------

/// Instant every scratch entry's mtime is pinned to, so date columns in the
/// goldens never move: 2025-01-15 12:00:00 UTC.
const PINNED_MTIME_SECS: u64 = 1_736_942_400;

/// The deterministic directory corpus the listing cases point lsr at. Every
/// case runs with this as its working directory; no case may write into it.
struct ScratchTree {
    dir: TempDir,
}

impl ScratchTree {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let base = dir.path().to_path_buf();
        let p = |name: &str| base.join(name);

        fs::create_dir(p("files"))?;
        fs::write(
            p("files/README.md"),
            b"# scratch corpus\n\nfixed contents for listing cases\n",
        )?;
        fs::write(p("files/plain.txt"), pattern_bytes(100))?;
        fs::write(p("files/medium.log"), pattern_bytes(2048))?;
        fs::write(p("files/archive.tar.gz"), pattern_bytes(40960))?;
        fs::write(p("files/two words.txt"), b"spaced name\n")?;
        fs::write(p("files/.hidden"), b"dotfile\n")?;
        fs::write(p("files/run.sh"), b"#!/bin/sh\nexit 0\n")?;
        fs::set_permissions(p("files/run.sh"), fs::Permissions::from_mode(0o755))?;
        fs::create_dir(p("files/nested"))?;
        fs::write(p("files/nested/deep.txt"), b"nested file\n")?;

        fs::create_dir(p("links"))?;
        symlink("../files/plain.txt", p("links/good"))?;
        symlink("nowhere", p("links/dangling"))?;
        symlink("../files/nested", p("links/dir-link"))?;

        fs::create_dir(p("pipes"))?;
        mkfifo(
            &p("pipes/events.fifo"),
            nix::sys::stat::Mode::from_bits_truncate(0o644),
        )?;

        fs::create_dir(p("empty"))?;
        fs::create_dir(p("locked"))?;

        pin_mtimes(&base)?;

        // Locked last: it must stay empty so TempDir can still remove it
        // despite mode 000.
        fs::set_permissions(p("locked"), fs::Permissions::from_mode(0o000))?;

        Ok(Self { dir })
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    // Fixed repeating pattern; goldens must never depend on random content.
    const PATTERN: &[u8] = b"lsr golden corpus\n";
    (0..len).map(|i| PATTERN[i % PATTERN.len()]).collect()
}

fn pin_mtimes(base: &Path) -> Result<()> {
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(PINNED_MTIME_SECS);
    for entry in WalkDir::new(base).into_iter().filter_map(Result::ok) {
        let kind = entry.file_type();
        // Symlinks would stamp their targets twice and opening a FIFO blocks;
        // neither has a date column any case compares.
        if kind.is_symlink() || !(kind.is_file() || kind.is_dir()) {
            continue;
        }
        let file = File::open(entry.path())?;
        file.set_modified(stamp)?;
    }
    Ok(())
}

// --------------------- Case table ------------------------------------------

fn suite_cases() -> Vec<TestCase> {
    let mut cases = vec![
        case("help", &["--help"]),
        case("version", &["--version"]),
        // Grid view
        case("grid default", &[]).width(80).target("files"),
        case("grid narrow", &[]).width(40).target("files"),
        case("grid wide", &[]).width(160).target("files"),
        case("grid no width", &[]).target("files"),
        case("grid across", &["--across"]).width(80).target("files"),
        case("grid reverse", &["--reverse"]).width(80).target("files"),
        case("oneline", &["--oneline"]).target("files"),
        // Long view
        case("long", &["--long"]).target("files"),
        case("long header", &["--long", "--header"]).target("files"),
        case("long group", &["--long", "--group"]).target("files"),
        case("long binary sizes", &["--long", "--binary"]).target("files"),
        case("long bytes", &["--long", "--bytes"]).target("files"),
        case("long inode", &["--long", "--inode"]).target("files"),
        case("long links", &["--long", "--links"]).target("files"),
        case("long blocks", &["--long", "--blocks"]).target("files"),
        case("long modified", &["--long", "--modified"]).target("files"),
        case("long accessed", &["--long", "--accessed"]).target("files"),
        // Dot-files and recursion
        case("all", &["--all", "--oneline"]).target("files"),
        case("all long", &["--all", "--long"]).target("files"),
        case("list dirs", &["--list-dirs", "--oneline"])
            .target("files")
            .target("empty"),
        case("recurse", &["--recurse", "--oneline"]).target("files"),
        case("tree", &["--tree"]).target("files"),
        case("tree depth", &["--tree", "--level=2"]).target("."),
        case("group dirs first", &["--group-directories-first", "--oneline"]).target("."),
        // Operand shapes
        case("file operand", &["--long"]).target("files/plain.txt"),
        case("file operands", &["--oneline"])
            .target("files/plain.txt")
            .target("files/medium.log"),
        case("mixed operands", &["--oneline"])
            .target("files/plain.txt")
            .target("empty"),
        case("spaced name", &["--oneline"]).target("files/two words.txt"),
        // Links and special files
        case("links grid", &["--oneline"]).target("links"),
        case("links long", &["--long"]).target("links"),
        case("dangling link long", &["--long"]).target("links/dangling"),
        case("fifo long", &["--long"]).target("pipes"),
        case("empty dir", &["--oneline"]).target("empty"),
        // Colour
        case("colour always grid", &[])
            .colour(ColourMode::Always)
            .width(80)
            .target("files"),
        case("colour always long", &["--long"])
            .colour(ColourMode::Always)
            .target("files"),
        case("colour never long", &["--long"])
            .colour(ColourMode::Never)
            .target("files"),
        // Locale: distinct month names prove the variables reach the child
        case("long locale fr", &["--long"])
            .locale("fr_FR.UTF-8")
            .target("files"),
        case("long locale ja", &["--long"])
            .locale("ja_JP.UTF-8")
            .target("files"),
        case("long locale c", &["--long"]).locale("C").target("files"),
        // Strict and debug modes
        case("strict clean", &["--long"]).strict().target("files"),
        case("strict duplicate long", &["-l", "--long"])
            .strict()
            .fails()
            .merged()
            .fixture("error_duplicate")
            .target("files"),
        case("strict sort twice", &["--sort=name", "--sort=size"])
            .strict()
            .fails()
            .merged()
            .fixture("error_sort_twice")
            .target("files"),
        case("debug trace", &["--long"])
            .debug()
            .merged()
            .fixture("long_debug")
            .target("files"),
        // Errors
        case("bad sort field", &["--sort=nonsense"])
            .fails()
            .merged()
            .fixture("error_bad_sort"),
        case("unknown option", &["--frobnicate"])
            .fails()
            .merged()
            .fixture("error_unknown"),
        case("missing target", &["--oneline"])
            .fails()
            .merged()
            .fixture("error_missing")
            .target("does-not-exist"),
        case("missing among targets", &["--oneline"])
            .fails()
            .merged()
            .fixture("error_missing_among")
            .target("does-not-exist")
            .target("files"),
        // Privilege-sensitive
        case("locked dir as nobody", &["--long"])
            .as_user("nobody")
            .fails()
            .merged()
            .fixture("error_locked")
            .target("locked"),
        case("listing as nobody", &["--oneline"])
            .as_user("nobody")
            .fixture("oneline_as_nobody")
            .target("files"),
    ];

    add_sort_matrix(&mut cases);
    cases
}

fn add_sort_matrix(cases: &mut Vec<TestCase>) {
    let fields = ["name", "size", "ext", "modified", "none"];
    let views: [(&str, &[&str]); 3] = [
        ("grid", &[]),
        ("long", &["--long"]),
        ("oneline", &["--oneline"]),
    ];
    for field in fields {
        for (view_name, view_args) in views {
            for reverse in [false, true] {
                let id = format!(
                    "sort {field} {view_name}{}",
                    if reverse { " reversed" } else { "" }
                );
                let mut args: Vec<String> = vec![format!("--sort={field}")];
                args.extend(view_args.iter().map(|arg| arg.to_string()));
                if reverse {
                    args.push("--reverse".to_string());
                }
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                let mut entry = case(&id, &arg_refs).target("files");
                if view_name == "grid" {
                    entry = entry.width(80);
                }
                cases.push(entry);
            }
        }
    }
}

// --------------------- Entry points ----------------------------------------

#[allow(clippy::too_many_arguments)]
fn run_suite(
    mode: BuildMode,
    filter: Option<String>,
    keep_going: bool,
    jobs: usize,
    timeout: Duration,
    fixtures: Option<PathBuf>,
    binary: Option<PathBuf>,
) -> Result<()> {
    let binary = resolve_binary(mode, binary)?;
    let fixture_root = fixtures.unwrap_or_else(default_fixture_root);
    let cases = select_cases(filter.as_deref());
    if cases.is_empty() {
        bail!("no cases match the filter");
    }

    let users: BTreeSet<String> = cases.iter().filter_map(|c| c.run_as.clone()).collect();
    let sudo = which::which("sudo").ok();
    let checks = preflight(&binary, &fixture_root, &users, sudo.as_deref())?;
    for warning in &checks.warnings {
        println!("[WARN] {warning}");
    }

    let fixtures = FixtureSet::load(&fixture_root)
        .with_context(|| format!("loading golden fixtures from {fixture_root:?}"))?;
    if VERBOSE.load(Ordering::Relaxed) {
        println!(
            "[INFO] {} golden fixtures loaded from {:?}",
            fixtures.len(),
            fixture_root
        );
    }
    let tree = ScratchTree::new().context("building the scratch listing tree")?;
    let runner = Runner {
        binary,
        sudo,
        fixtures,
        tree_root: tree.root().to_path_buf(),
        timeout,
        elevation: checks.elevation,
    };

    let policy = if keep_going {
        Policy::KeepGoing
    } else {
        Policy::FailFast
    };
    let report = run_all(&runner, &cases, policy, jobs);
    println!(
        "\n{} passed, {} failed, {} skipped ({} cases).",
        report.passed(),
        report.failed(),
        report.skipped(),
        report.entries.len()
    );
    if report.failed() > 0 {
        bail!("failures encountered");
    }
    Ok(())
}

fn regen(
    mode: BuildMode,
    filter: Option<String>,
    fixtures: Option<PathBuf>,
    binary: Option<PathBuf>,
) -> Result<()> {
    let binary = resolve_binary(mode, binary)?;
    if !binary.is_file() {
        bail!(PreflightError::BinaryMissing(binary));
    }
    let fixture_root = fixtures.unwrap_or_else(default_fixture_root);
    fs::create_dir_all(&fixture_root)?;
    let cases = select_cases(filter.as_deref());
    if cases.is_empty() {
        bail!("no cases match the filter");
    }

    let users: BTreeSet<String> = cases.iter().filter_map(|c| c.run_as.clone()).collect();
    let sudo = which::which("sudo").ok();
    let elevation: BTreeSet<String> = users
        .into_iter()
        .filter(|user| can_elevate(sudo.as_deref(), user))
        .collect();

    let tree = ScratchTree::new().context("building the scratch listing tree")?;
    let runner = Runner {
        binary,
        sudo,
        fixtures: FixtureSet::empty(),
        tree_root: tree.root().to_path_buf(),
        timeout: Duration::from_secs(30),
        elevation,
    };

    let mut recorded = BTreeSet::new();
    let mut written = 0usize;
    let mut failures = 0usize;
    for case in &cases {
        if let Some(user) = &case.run_as {
            if !runner.elevation.contains(user) {
                println!("[SKIP] {}: privilege elevation unavailable", case.id);
                continue;
            }
        }
        // Several cases may share one golden file; record it once.
        if !recorded.insert(case.fixture.clone()) {
            continue;
        }
        let result = match runner.capture_case(case) {
            Ok(result) => result,
            Err(err) => {
                println!("[FAIL] {}: {err}", case.id);
                failures += 1;
                continue;
            }
        };
        if (result.exit_code == 0) != (case.exit == ExitClass::Success) {
            println!(
                "[FAIL] {}: unexpected exit code {} while recording",
                case.id, result.exit_code
            );
            failures += 1;
            continue;
        }
        let path = fixture_root.join(&case.fixture);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, result.observed())?;
        println!("[GOLD] {} ({}B)", case.fixture, result.observed().len());
        written += 1;
    }
    println!("\n{written} golden fixtures recorded.");
    if failures > 0 {
        bail!("regen failures encountered");
    }
    Ok(())
}

fn select_cases(filter: Option<&str>) -> Vec<TestCase> {
    let mut cases = suite_cases();
    if let Some(filter) = filter {
        cases.retain(|case| case.id.contains(filter));
    }
    cases
}

fn resolve_binary(mode: BuildMode, explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .context("expected the harness to live inside the lsr repository")?
        .to_path_buf();
    Ok(root.join("target").join(mode.profile()).join("lsr"))
}

fn default_fixture_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

// --------------------- Tests -----------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> PathBuf {
        which::which("sh").expect("sh available")
    }

    fn tool(name: &str) -> PathBuf {
        which::which(name).expect("coreutil available")
    }

    fn run(
        binary: &Path,
        args: &[&str],
        merged: bool,
        delta: &EnvDelta,
    ) -> Result<ExecutionResult, ExecutionError> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let cwd = std::env::temp_dir();
        execute(&Invocation {
            binary,
            sudo: None,
            args: &args,
            delta,
            cwd: &cwd,
            run_as: None,
            merged,
            timeout: Duration::from_secs(10),
        })
    }

    fn stub_runner(fixtures: &[(&str, &[u8])]) -> Result<(Runner, TempDir, TempDir)> {
        let fixture_dir = TempDir::new()?;
        for (id, bytes) in fixtures {
            fs::write(fixture_dir.path().join(id), bytes)?;
        }
        let tree = TempDir::new()?;
        let runner = Runner {
            binary: sh(),
            sudo: None,
            fixtures: FixtureSet::load(fixture_dir.path())?,
            tree_root: tree.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            elevation: BTreeSet::new(),
        };
        Ok((runner, fixture_dir, tree))
    }

    fn script_case(id: &str, script: &str) -> TestCase {
        case(id, &["-c", script]).fixture(id)
    }

    // ----- Environment builder -----

    #[test]
    fn unset_width_introduces_no_columns() {
        let delta = EnvSpec::default().delta();
        assert!(delta.set.iter().all(|(key, _)| *key != "COLUMNS"));
        assert!(delta.unset.contains(&"COLUMNS"));
    }

    #[test]
    fn populated_env_sets_every_requested_variable() {
        let env = EnvSpec {
            terminal_width: Some(80),
            locale: Some("fr_FR.UTF-8".to_string()),
            strict: true,
            debug: true,
            colour: ColourMode::Auto,
        };
        let delta = env.delta();
        let lookup = |key: &str| {
            delta
                .set
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(lookup("COLUMNS"), Some("80"));
        assert_eq!(lookup("LC_ALL"), Some("fr_FR.UTF-8"));
        assert_eq!(lookup("LANG"), Some("fr_FR.UTF-8"));
        assert_eq!(lookup("LSR_STRICT"), Some("1"));
        assert_eq!(lookup("LSR_DEBUG"), Some("1"));
        assert_eq!(lookup("TZ"), Some("UTC"));
        assert!(delta.unset.is_empty());
    }

    #[test]
    fn colour_auto_adds_no_flag() {
        assert_eq!(EnvSpec::default().colour_flag(), None);
        let never = EnvSpec {
            colour: ColourMode::Never,
            ..EnvSpec::default()
        };
        assert_eq!(never.colour_flag(), Some("--colour=never".to_string()));
    }

    #[test]
    fn environment_reaches_the_child_without_leaking() -> Result<()> {
        let script = r#"printf '%s' "${COLUMNS-unset}""#;
        let wide = EnvSpec {
            terminal_width: Some(80),
            ..EnvSpec::default()
        };
        let out = run(&sh(), &["-c", script], false, &wide.delta())?;
        assert_eq!(out.stdout, b"80");
        // Width left unset must mean no COLUMNS at all, even if the harness
        // process itself inherited one from a terminal.
        let out = run(&sh(), &["-c", script], false, &EnvSpec::default().delta())?;
        assert_eq!(out.stdout, b"unset");
        Ok(())
    }

    #[test]
    fn locale_overrides_reach_the_child_process() -> Result<()> {
        let script = r#"printf '%s' "$LC_ALL""#;
        let fr = EnvSpec {
            locale: Some("fr_FR.UTF-8".to_string()),
            ..EnvSpec::default()
        };
        let ja = EnvSpec {
            locale: Some("ja_JP.UTF-8".to_string()),
            ..EnvSpec::default()
        };
        let fr_out = run(&sh(), &["-c", script], false, &fr.delta())?;
        let ja_out = run(&sh(), &["-c", script], false, &ja.delta())?;
        assert_eq!(fr_out.stdout, b"fr_FR.UTF-8");
        assert_eq!(ja_out.stdout, b"ja_JP.UTF-8");
        assert_ne!(fr_out.stdout, ja_out.stdout);
        Ok(())
    }

    // ----- Comparator -----

    #[test]
    fn identical_bytes_compare_equal() {
        assert_eq!(compare(b"abc", b"abc"), ComparisonOutcome::Equal);
        assert_eq!(compare(b"", b""), ComparisonOutcome::Equal);
    }

    #[test]
    fn divergence_reports_first_differing_offset() {
        assert_eq!(
            compare(b"abcd", b"abXd"),
            ComparisonOutcome::Different { offset: 2 }
        );
    }

    #[test]
    fn length_mismatch_diverges_at_shared_prefix_end() {
        assert_eq!(
            compare(b"abc", b"abcd"),
            ComparisonOutcome::Different { offset: 3 }
        );
        assert_eq!(
            compare(b"abcd", b"abc"),
            ComparisonOutcome::Different { offset: 3 }
        );
    }

    // ----- Fixture store -----

    #[test]
    fn fixture_store_keys_by_relative_path() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("help"), b"usage\n")?;
        fs::create_dir(dir.path().join("errors"))?;
        fs::write(dir.path().join("errors/missing"), b"nope\n")?;
        let set = FixtureSet::load(dir.path())?;
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("help")?, b"usage\n".as_slice());
        assert_eq!(set.get("errors/missing")?, b"nope\n".as_slice());
        Ok(())
    }

    #[test]
    fn unknown_fixture_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let set = FixtureSet::load(dir.path())?;
        let err = set.get("ghost").unwrap_err();
        assert!(matches!(err, FixtureError::NotFound(_)));
        Ok(())
    }

    // ----- Invoker -----

    #[test]
    fn invoker_captures_stdout_and_exit() -> Result<()> {
        let out = run(
            &sh(),
            &["-c", "printf hello"],
            false,
            &EnvSpec::default().delta(),
        )?;
        assert_eq!(out.stdout, b"hello");
        assert!(out.stderr.is_empty());
        assert_eq!(out.exit_code, 0);
        Ok(())
    }

    #[test]
    fn invoker_reports_nonzero_exit() -> Result<()> {
        let out = run(&sh(), &["-c", "exit 3"], false, &EnvSpec::default().delta())?;
        assert_eq!(out.exit_code, 3);
        Ok(())
    }

    #[test]
    fn missing_binary_is_a_typed_error() {
        let err = run(
            Path::new("/no/such/lsr"),
            &[],
            false,
            &EnvSpec::default().delta(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::BinaryMissing(_)));
    }

    #[test]
    fn merged_capture_preserves_stream_order() -> Result<()> {
        let out = run(
            &sh(),
            &["-c", "echo one; echo two 1>&2; echo three"],
            true,
            &EnvSpec::default().delta(),
        )?;
        assert_eq!(out.stdout, b"one\ntwo\nthree\n");
        assert!(out.stderr.is_empty());
        Ok(())
    }

    #[test]
    fn timeout_kills_the_child() {
        let args = vec!["5".to_string()];
        let delta = EnvSpec::default().delta();
        let cwd = std::env::temp_dir();
        let err = execute(&Invocation {
            binary: &tool("sleep"),
            sudo: None,
            args: &args,
            delta: &delta,
            cwd: &cwd,
            run_as: None,
            merged: false,
            timeout: Duration::from_millis(200),
        })
        .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)));
    }

    #[test]
    fn signal_death_maps_to_a_synthetic_code() -> Result<()> {
        let out = run(
            &sh(),
            &["-c", "kill -TERM $$"],
            false,
            &EnvSpec::default().delta(),
        )?;
        assert_eq!(out.exit_code, 128 + 15);
        Ok(())
    }

    #[test]
    fn unexecutable_binary_is_spawn_denied() -> Result<()> {
        let dir = TempDir::new()?;
        let script = dir.path().join("lsr");
        fs::write(&script, "#!/bin/sh\necho hi\n")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644))?;
        let err = run(&script, &[], false, &EnvSpec::default().delta()).unwrap_err();
        assert!(matches!(err, ExecutionError::SpawnDenied(_)));
        Ok(())
    }

    // ----- Case runner -----

    #[test]
    fn passing_case_is_reported_pass() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&[("greet", b"hi\n")])?;
        let outcome = runner.run_case(&script_case("greet", "echo hi"));
        assert_eq!(outcome, Outcome::Pass);
        Ok(())
    }

    #[test]
    fn byte_mismatch_names_the_offset() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&[("greet", b"ha\n")])?;
        let outcome = runner.run_case(&script_case("greet", "echo hi"));
        match outcome {
            Outcome::Fail(reason) => assert!(reason.contains("at byte 1"), "{reason}"),
            other => panic!("expected Fail, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn wrong_exit_class_fails_even_with_matching_bytes() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&[("boom", b"")])?;
        let outcome = runner.run_case(&script_case("boom", "exit 2"));
        match outcome {
            Outcome::Fail(reason) => assert!(reason.contains("unexpected exit code 2"), "{reason}"),
            other => panic!("expected Fail, got {other:?}"),
        }
        let outcome = runner.run_case(&script_case("boom", "exit 0").fails());
        match outcome {
            Outcome::Fail(reason) => assert!(reason.contains("unexpected exit code 0"), "{reason}"),
            other => panic!("expected Fail, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn missing_fixture_fails_the_case() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&[])?;
        let outcome = runner.run_case(&script_case("ghost", "true"));
        match outcome {
            Outcome::Fail(reason) => assert!(reason.contains("ghost"), "{reason}"),
            other => panic!("expected Fail, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn elevation_gap_skips_instead_of_failing() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&[("root-only", b"")])?;
        let outcome = runner.run_case(&script_case("root-only", "true").as_user("nobody"));
        assert_eq!(
            outcome,
            Outcome::Skipped("privilege elevation unavailable".to_string())
        );
        Ok(())
    }

    // ----- Suite orchestrator -----

    fn three_cases() -> Vec<TestCase> {
        vec![
            script_case("one", "echo 1"),
            script_case("two", "echo wrong"),
            script_case("three", "echo 3"),
        ]
    }

    fn three_fixtures() -> [(&'static str, &'static [u8]); 3] {
        [("one", b"1\n"), ("two", b"2\n"), ("three", b"3\n")]
    }

    #[test]
    fn fail_fast_skips_the_remaining_cases() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&three_fixtures())?;
        let report = run_all(&runner, &three_cases(), Policy::FailFast, 1);
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.entries[0].1, Outcome::Pass);
        assert!(matches!(report.entries[1].1, Outcome::Fail(_)));
        assert_eq!(
            report.entries[2].1,
            Outcome::Skipped("fail-fast abort".to_string())
        );
        assert_eq!(report.failed(), 1);
        Ok(())
    }

    #[test]
    fn keep_going_reports_every_case_in_declaration_order() -> Result<()> {
        let (runner, _fx, _tree) = stub_runner(&three_fixtures())?;
        let report = run_all(&runner, &three_cases(), Policy::KeepGoing, 2);
        assert_eq!(report.entries.len(), 3);
        let ids: Vec<&str> = report.entries.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["one", "two", "three"]);
        assert_eq!(report.passed(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 0);
        Ok(())
    }

    // ----- Preflight -----

    #[test]
    fn preflight_rejects_a_missing_binary() -> Result<()> {
        let dir = TempDir::new()?;
        let err =
            preflight(&dir.path().join("lsr"), dir.path(), &BTreeSet::new(), None).unwrap_err();
        assert!(err.to_string().contains("build it first"), "{err}");
        Ok(())
    }

    #[test]
    fn stale_fixtures_raise_a_warning() -> Result<()> {
        let dir = TempDir::new()?;
        let binary = dir.path().join("lsr");
        fs::write(&binary, b"#!/bin/sh\n")?;
        let fixture_root = dir.path().join("fixtures");
        fs::create_dir(&fixture_root)?;
        let stale = fixture_root.join("help");
        fs::write(&stale, b"old\n")?;
        let old = SystemTime::now() - STALENESS_LIMIT - Duration::from_secs(86_400);
        File::open(&stale)?.set_modified(old)?;
        let checks = preflight(&binary, &fixture_root, &BTreeSet::new(), None)?;
        assert_eq!(checks.warnings.len(), 1);
        assert!(checks.warnings[0].contains("over a year old"));
        Ok(())
    }

    #[test]
    fn fresh_fixtures_pass_preflight_quietly() -> Result<()> {
        let dir = TempDir::new()?;
        let binary = dir.path().join("lsr");
        fs::write(&binary, b"#!/bin/sh\n")?;
        let fixture_root = dir.path().join("fixtures");
        fs::create_dir(&fixture_root)?;
        fs::write(fixture_root.join("help"), b"fresh\n")?;
        let checks = preflight(&binary, &fixture_root, &BTreeSet::new(), None)?;
        assert!(checks.warnings.is_empty());
        assert!(checks.elevation.is_empty());
        Ok(())
    }

    // ----- Scratch tree and case table -----

    #[test]
    fn scratch_tree_is_deterministic() -> Result<()> {
        let tree = ScratchTree::new()?;
        let plain = tree.root().join("files/plain.txt");
        assert_eq!(fs::metadata(&plain)?.len(), 100);
        assert_eq!(
            fs::metadata(&plain)?.modified()?,
            SystemTime::UNIX_EPOCH + Duration::from_secs(PINNED_MTIME_SECS)
        );
        assert!(tree.root().join("pipes/events.fifo").exists());
        let locked = fs::metadata(tree.root().join("locked"))?;
        assert_eq!(locked.permissions().mode() & 0o777, 0);
        let dangling = fs::symlink_metadata(tree.root().join("links/dangling"))?;
        assert!(dangling.file_type().is_symlink());
        Ok(())
    }

    #[test]
    fn suite_ids_are_unique_and_fixtures_are_path_safe() {
        let cases = suite_cases();
        assert!(
            cases.len() >= 75,
            "expected a broad matrix, got {}",
            cases.len()
        );
        let mut ids = BTreeSet::new();
        for case in &cases {
            assert!(ids.insert(case.id.clone()), "duplicate case id {}", case.id);
            assert!(!case.fixture.contains(' '), "fixture id {}", case.fixture);
        }
    }

    #[test]
    fn filter_narrows_the_case_list() {
        let all = select_cases(None).len();
        let sorted = select_cases(Some("sort"));
        assert!(!sorted.is_empty());
        assert!(sorted.len() < all);
        assert!(sorted.iter().all(|case| case.id.contains("sort")));
    }

    #[test]
    fn regen_rejects_an_unmatched_filter() -> Result<()> {
        let fixtures = TempDir::new()?;
        let err = regen(
            BuildMode::Debug,
            Some("no such case id".to_string()),
            Some(fixtures.path().to_path_buf()),
            Some(sh()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no cases match the filter"));
        Ok(())
    }
}
