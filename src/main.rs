use std::fmt;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use simplelog::*;

use tapd::actions::{self, Action, Assignments};
use tapd::backend::{
    self, EmitterKind, LayouterKind, ListenerKind,
};
use tapd::keys;
use tapd::privs::privileges;
use tapd::settings::Settings;
use tapd::tapper::Tapper;

#[derive(Parser, Debug)]
#[command(author, version, verbatim_doc_comment)]
/// tapd: switch keyboard layouts and send keystrokes by tapping keys
///
/// A tap is a quick press-and-release of a single key with no other key
/// held at the same time; holding the key or combining it with another key
/// leaves its normal function untouched. Each positional argument assigns
/// actions to a key:
///
///     tapd capslock=@1 rightctrl=@2 102nd=playpause
///
/// `KEY` is a Linux key code or key name. An action is `@N` to activate
/// keyboard layout number N, or a key code/name to emit a tap of that key.
/// `KEY=` removes the assignment stored for KEY.
struct Args {
    /// Key assignments, `KEY=ACTION[,ACTION...]`.
    #[arg(value_name = "KEY=ACTIONS")]
    assignments: Vec<String>,

    /// Listener to use for input events.
    #[arg(long, value_enum, default_value_t)]
    listener: ListenerKind,

    /// Layouter to use for layout activation and session tracking.
    #[arg(long, value_enum, default_value_t)]
    layouter: LayouterKind,

    /// Emitter to use for synthesized keystrokes.
    #[arg(long, value_enum, default_value_t)]
    emitter: EmitterKind,

    /// Ring the bell when a layout is activated.
    #[arg(long)]
    bell: bool,

    /// Do not ring the bell when a layout is activated.
    #[arg(long, conflicts_with = "bell")]
    no_bell: bool,

    /// Print tapped keys instead of executing assignments.
    #[arg(long)]
    show_taps: bool,

    /// List known key codes and names, then exit.
    #[arg(long)]
    list_keys: bool,

    /// Save the merged settings to the settings file and exit.
    #[arg(long)]
    save: bool,

    /// Ignore the settings file for this run.
    #[arg(long)]
    no_load: bool,

    /// Do not print the startup summary.
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging; implies --debug as well.
    #[arg(short, long)]
    trace: bool,
}

/// Marker attached to configuration errors so `main` can exit with the
/// usage-error code rather than the runtime one.
#[derive(Debug)]
struct UsageError;

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("bad usage")
    }
}

fn usage(e: anyhow::Error) -> anyhow::Error {
    e.context(UsageError)
}

const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_USAGE_ERROR: u8 = 2;

fn init_logging(args: &Args) {
    let log_lvl = match (args.debug, args.trace) {
        (_, true) => LevelFilter::Trace,
        (true, false) => LevelFilter::Debug,
        (false, false) => LevelFilter::Info,
    };

    let mut log_cfg = ConfigBuilder::new();
    if let Err(e) = log_cfg.set_time_offset_to_local() {
        eprintln!("WARNING: could not set log TZ to local: {e:?}");
    };
    log_cfg.set_time_format_rfc3339();
    CombinedLogger::init(vec![TermLogger::new(
        log_lvl,
        log_cfg.build(),
        TerminalMode::Mixed,
        ColorChoice::AlwaysAnsi,
    )])
    .expect("logger can init");
}

/// Builds an assignment table from `KEY=ACTIONS` tokens. Assigning the same
/// key twice in one invocation is almost certainly a typo, so it is refused.
fn parse_assignment_args(tokens: &[String]) -> Result<Assignments> {
    let mut table = Assignments::new();
    for token in tokens {
        let (key_text, actions_text) = token.split_once('=').ok_or_else(|| {
            anyhow!("bad assignment {token:?}: expected KEY=ACTION[,ACTION...]")
        })?;
        let key = keys::parse_key(key_text)?;
        let actions = actions::parse_actions(actions_text)?;
        if table.insert(key, actions).is_some() {
            return Err(anyhow!(
                "key {} is assigned more than once",
                keys::key_full_name(key)
            ));
        }
    }
    Ok(table)
}

fn settings_from_args(args: &Args) -> Result<Settings> {
    Ok(Settings {
        listener: args.listener,
        layouter: args.layouter,
        emitter: args.emitter,
        bell: match (args.bell, args.no_bell) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        },
        assignments: parse_assignment_args(&args.assignments)?,
    })
}

fn list_keys() {
    for key in keys::known_keys() {
        println!("{}", keys::key_full_name(key));
    }
}

fn describe_actions(actions: &[Action]) -> String {
    if actions.is_empty() {
        return "does nothing".into();
    }
    actions
        .iter()
        .map(|action| match action {
            Action::None => "does nothing".into(),
            Action::ActivateLayout(layout) => format!("activates layout {layout}"),
            Action::EmitKeyTap(key) => {
                format!("emits a tap on key {}", keys::key_full_name(*key))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_intro(settings: &Settings, show_taps: bool) {
    println!("tapd v{}.", env!("CARGO_PKG_VERSION"));
    println!(
        "Starting in {}/{}/{} configuration.",
        settings.listener, settings.layouter, settings.emitter
    );
    if show_taps {
        println!("Tap keys to see their codes and names.");
        return;
    }
    println!(
        "Bell is {}.",
        if settings.bell.unwrap_or(false) {
            "enabled"
        } else {
            "disabled"
        }
    );
    for (key, actions) in &settings.assignments {
        println!(
            "Tap on key {} {}.",
            keys::key_full_name(*key),
            describe_actions(actions)
        );
    }
}

fn main_impl() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    info!("tapd v{} starting", env!("CARGO_PKG_VERSION"));

    // Reach least privilege before doing anything else with the process.
    privileges()
        .init()
        .context("can't reach least privilege")?;

    if args.list_keys {
        list_keys();
        return Ok(());
    }

    let cli = settings_from_args(&args).map_err(usage)?;
    let mut settings = if args.no_load {
        Settings::default()
    } else {
        Settings::load()?
    };
    settings.merge(&cli);
    log::debug!("effective settings: {settings}");

    if args.save {
        settings.save()?;
        return Ok(());
    }

    if settings.assignments.is_empty() && !args.show_taps {
        // Nobody asked for anything; don't sit on the input devices.
        println!("No assignments made, nothing to do.");
        return Ok(());
    }

    // Backend selection spends the unneeded privilege reservoirs.
    let listener = backend::make_listener(settings.listener)?;
    let layouter = backend::make_layouter(settings.layouter)?;
    let emitter = backend::make_emitter(
        settings.emitter,
        actions::has_key_emits(&settings.assignments),
    )?;
    settings.listener = listener.kind();
    settings.layouter = layouter.kind();
    settings.emitter = emitter.kind();

    if !args.show_taps {
        if layouter.kind() == LayouterKind::Dummy
            && actions::has_layout_activations(&settings.assignments)
        {
            log::warn!("the dummy layouter will not activate layouts");
        }
        if emitter.kind() == EmitterKind::Dummy && actions::has_key_emits(&settings.assignments)
        {
            log::warn!("the dummy emitter will not emit keys");
        }
    }

    let mut tapper = Tapper::new(listener, layouter, emitter);
    tapper.start(
        settings.assignments.clone(),
        settings.bell.unwrap_or(false),
        args.show_taps,
    )?;
    log::debug!(
        "running with uids {}, gids {}",
        privileges().user_ids(),
        privileges().group_ids()
    );

    if !args.quiet {
        print_intro(&settings, args.show_taps);
    }
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("can't install signal handlers")?;
    if let Some(signal) = signals.forever().next() {
        info!("caught signal {signal}, shutting down");
    }

    tapper.stop()?;
    Ok(())
}

fn main() -> ExitCode {
    match main_impl() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            if e.is::<UsageError>() {
                eprintln!("For more info, pass the `-h` or `--help` flags.");
                ExitCode::from(EXIT_USAGE_ERROR)
            } else {
                ExitCode::from(EXIT_RUNTIME_ERROR)
            }
        }
    }
}
