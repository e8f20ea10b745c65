//! avrflash - AVR microcontroller programmer
//!
//! Uploads, downloads and verifies the memories of AVR parts through the
//! programmers compiled into `avrflash-prog`, and runs an interactive
//! terminal on the same session.
//!
//! A run goes through these steps:
//! 1. load the part catalogue (`-C`);
//! 2. check every `-U` request before touching the device;
//! 3. open the programmer, enter programming mode and check the signature;
//! 4. chip erase for `-e` or auto erase;
//! 5. run `-U`, `-t` and `-T` in command-line order;
//! 6. flush the page cache and close the programmer.

mod cli;
mod progress;

use std::error::Error as StdError;
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{ArgMatches, CommandFactory, FromArgMatches};
use log::{debug, error, info, warn, LevelFilter};

use avrflash_core::part::{Part, PartDatabase};
use avrflash_core::programmer::Led;
use avrflash_core::session::Session;
use avrflash_core::update::{dryrun, DryRunHistory, Update, UpdateFlags};
use avrflash_core::{Error, ErrorKind};
use avrflash_prog::{serialadapter, ProgrammerOptions};
use avrflash_term::Terminal;

use cli::Cli;
use progress::BarProgress;

type BoxResult<T> = Result<T, Box<dyn StdError>>;

/// Baud rate that makes Arduino-style boards enter their bootloader
const TOUCH_BAUD: u32 = 1200;

fn main() -> ExitCode {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if let Err(e) = init_logging(&cli) {
        eprintln!("avrflash: cannot open log file: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli, &matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if let Some(core) = e.downcast_ref::<Error>() {
                debug!("raised at {}", core.location());
            }
            ExitCode::FAILURE
        }
    }
}

/// Log level for the given number of -v and -q flags
fn log_level(verbose: u8, quiet: u8) -> LevelFilter {
    match i32::from(verbose) - i32::from(quiet) {
        i32::MIN..=-2 => LevelFilter::Error,
        -1 => LevelFilter::Warn,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn init_logging(cli: &Cli) -> io::Result<()> {
    // RUST_LOG wins over -v/-q
    let from_env = std::env::var_os("RUST_LOG").is_some();
    let mut builder = env_logger::Builder::new();
    if from_env {
        builder.parse_default_env();
    } else {
        builder.filter_level(LevelFilter::Trace);
    }
    if let Some(path) = &cli.logfile {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();

    // the terminal's verbose command changes the level later on
    if !from_env {
        log::set_max_level(log_level(cli.verbose, cli.quiet));
    }
    Ok(())
}

/// Load the built-in catalogue, or the -C files in order
fn load_catalogue(files: &[String]) -> BoxResult<PartDatabase> {
    let mut db = if files.first().is_some_and(|f| !f.starts_with('+')) {
        PartDatabase::new()
    } else {
        PartDatabase::builtin()?
    };
    for file in files {
        let path = match file.strip_prefix('+') {
            Some(extra) => extra,
            None => {
                db = PartDatabase::new();
                file.as_str()
            }
        };
        let n = db.load_file(Path::new(path))?;
        debug!("loaded {} parts from {}", n, path);
    }
    Ok(db)
}

fn list_parts(db: &PartDatabase) {
    let mut parts: Vec<&Part> = db.parts().collect();
    parts.sort_by(|a, b| a.id.cmp(&b.id));
    println!("Valid parts are:");
    for p in parts {
        println!("  {:<16} = {:<20} [{}]", p.id, p.desc, p.prog_modes.names());
    }
}

/// -U, -t and -T in the order they appear on the command line
fn ordered_updates(matches: &ArgMatches) -> BoxResult<Vec<Update>> {
    let mut items: Vec<(usize, Update)> = Vec::new();
    if let (Some(vals), Some(idx)) = (matches.get_many::<String>("update"), matches.indices_of("update")) {
        for (v, i) in vals.zip(idx) {
            items.push((i, Update::parse(v)?));
        }
    }
    if let (Some(vals), Some(idx)) = (matches.get_many::<String>("terminal_cmd"), matches.indices_of("terminal_cmd")) {
        for (v, i) in vals.zip(idx) {
            items.push((i, Update::command(v.clone())));
        }
    }
    if let Some(idx) = matches.indices_of("terminal") {
        items.extend(idx.map(|i| (i, Update::interactive())));
    }
    items.sort_by_key(|(i, _)| *i);
    Ok(items.into_iter().map(|(_, u)| u).collect())
}

fn update_flags(cli: &Cli) -> UpdateFlags {
    let mut flags = UpdateFlags::default();
    flags.set(UpdateFlags::AUTO_ERASE, !cli.no_auto_erase);
    flags.set(UpdateFlags::VERIFY, !cli.no_verify);
    flags.set(UpdateFlags::NOWRITE, cli.no_write);
    flags.set(UpdateFlags::KEEP_TRAILING_FF, cli.keep_trailing_ff);
    flags.set(UpdateFlags::FORCE, cli.force);
    flags
}

fn run(cli: &Cli, matches: &ArgMatches) -> BoxResult<()> {
    match cli.programmer.as_deref() {
        Some("?") => {
            println!("{}", avrflash_prog::programmer_help());
            return Ok(());
        }
        Some("?type") => {
            println!("{}", avrflash_prog::driver_help());
            return Ok(());
        }
        _ => {}
    }

    let db = load_catalogue(&cli.config)?;
    if cli.part.as_deref() == Some("?") {
        list_parts(&db);
        return Ok(());
    }

    let pgm_name = cli
        .programmer
        .as_deref()
        .ok_or("no programmer specified; use -c ? for a list")?;
    let info = avrflash_prog::find_programmer(pgm_name)
        .ok_or_else(|| format!("unknown programmer {}\n{}", pgm_name, avrflash_prog::programmer_help()))?;
    if avrflash_prog::wants_help(&cli.extparams) {
        match avrflash_prog::extparam_help(info.name) {
            Some(help) => println!("{}", help),
            None => println!("{} has no extended parameters", info.name),
        }
        return Ok(());
    }

    let part_name = cli.part.as_deref().ok_or("no part specified; use -p ? for a list")?;
    let part = db
        .find(part_name)
        .ok_or_else(|| format!("part {} not found; use -p ? for a list", part_name))?
        .clone();

    let mut updates = ordered_updates(matches)?;
    let mut history = DryRunHistory::default();
    for upd in &mut updates {
        if let Err(e) = dryrun(Some(&part), upd, &mut history) {
            if !e.is_soft() {
                return Err(e.into());
            }
            warn!("{}", e);
        }
    }

    if !cli.exitspec.is_empty() {
        warn!("-E {} ignored: {} has no exit pin control", cli.exitspec.join(","), info.name);
    }

    let mut port = cli.port.clone();
    if info.serial {
        if let Some(spec) = port.take() {
            let mut resolved = serialadapter::setport(&spec, db.serial_adapters())?;
            if cli.touch {
                info!("touching {} at {} baud", resolved, TOUCH_BAUD);
                resolved = serialadapter::touch(&resolved, TOUCH_BAUD)?;
            }
            port = Some(resolved);
        }
    } else if cli.touch {
        warn!("-r ignored: {} does not use a serial port", info.name);
    }

    let opts = ProgrammerOptions {
        port,
        baud: cli.baud,
        bitclock: cli.bitclock,
        isp_delay: cli.isp_delay,
        extparams: cli.extparams.clone(),
    };
    let pgm = avrflash_prog::open(info.name, &opts, &part)?;

    let cancel = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel))?;
    let mut progress = BarProgress::new(cli.quiet >= 2, Arc::clone(&cancel));

    let mut session = Session::new(pgm, part, update_flags(cli));
    let result = program(&mut session, &db, cli, &updates, &mut progress, &cancel);
    if result.is_err() {
        let _ = session.pgm.set_led(Led::Err, true);
    }

    // flush best-effort even after an interrupt
    cancel.store(false, Ordering::Relaxed);
    let finished = session.finish(&mut progress);
    result?;
    finished?;
    Ok(())
}

fn program(
    session: &mut Session,
    db: &PartDatabase,
    cli: &Cli,
    updates: &[Update],
    progress: &mut BarProgress,
    cancel: &AtomicBool,
) -> BoxResult<()> {
    if let Err(e) = session.start() {
        if !cli.force {
            return Err(e.with_context("initialization failed; use -F to override this check").into());
        }
        warn!("initialization failed ({}); continuing due to -F", e);
    }
    let _ = session.pgm.set_led(Led::Rdy, true);

    if cli.osccal {
        return Err(Error::new(
            ErrorKind::Unsupported,
            format!("{} cannot calibrate the RC oscillator", session.pgm.name()),
        )
        .into());
    }

    session.check_signature(db, cli.force)?;

    let auto_erase = session.wants_auto_erase(updates);
    if cli.erase || (auto_erase && !cli.no_write) {
        session.chip_erase()?;
    }

    for upd in updates {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::HardFail, "interrupted").into());
        }
        match upd {
            Update::Memory(m) => match session.do_op(m, progress) {
                Err(e) if e.is_soft() => warn!("{}", e),
                other => other?,
            },
            Update::Terminal(None) => {
                let mut out = io::stdout();
                let mut term = Terminal::new(session, progress, &mut out);
                avrflash_term::run_interactive(&mut term)?;
                // ^C inside the terminal only interrupts the running command
                cancel.store(false, Ordering::Relaxed);
            }
            Update::Terminal(Some(line)) => {
                let mut out = io::stdout();
                let mut term = Terminal::new(session, progress, &mut out);
                term.run_line(line)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Cli, ArgMatches) {
        let matches = Cli::command().try_get_matches_from(args).unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        (cli, matches)
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0, 0), LevelFilter::Info);
        assert_eq!(log_level(1, 0), LevelFilter::Debug);
        assert_eq!(log_level(3, 0), LevelFilter::Trace);
        assert_eq!(log_level(0, 1), LevelFilter::Warn);
        assert_eq!(log_level(0, 4), LevelFilter::Error);
    }

    #[test]
    fn test_updates_keep_command_line_order() {
        let (_, m) = parse(&[
            "avrflash",
            "-U",
            "flash:w:0x01:m",
            "-T",
            "dump eeprom",
            "-U",
            "eeprom:r:-:h",
            "-t",
        ]);
        let updates = ordered_updates(&m).unwrap();
        assert_eq!(updates.len(), 4);
        assert!(matches!(updates[0], Update::Memory(_)));
        assert!(matches!(&updates[1], Update::Terminal(Some(c)) if c == "dump eeprom"));
        assert!(matches!(updates[2], Update::Memory(_)));
        assert!(matches!(updates[3], Update::Terminal(None)));
    }

    #[test]
    fn test_flags_and_bitclock() {
        let (cli, _) = parse(&["avrflash", "-D", "-V", "-n", "-B", "125kHz", "-qq"]);
        let flags = update_flags(&cli);
        assert!(!flags.contains(UpdateFlags::FORCE));
        assert!(!flags.contains(UpdateFlags::AUTO_ERASE));
        assert!(!flags.contains(UpdateFlags::VERIFY));
        assert!(flags.contains(UpdateFlags::NOWRITE));
        assert!((cli.bitclock.unwrap() - 8e-6).abs() < 1e-12);
        assert_eq!(cli.quiet, 2);
    }

    #[test]
    #[cfg(feature = "dummy")]
    fn test_dummy_session_end_to_end() {
        let db = load_catalogue(&[]).unwrap();
        let part = db.find("m328p").unwrap().clone();
        let (cli, m) = parse(&["avrflash", "-p", "m328p", "-c", "dummy", "-U", "eeprom:w:1,2,3:m", "-T", "dump eeprom 0 4"]);
        let updates = ordered_updates(&m).unwrap();
        let pgm = avrflash_prog::open("dummy", &ProgrammerOptions::default(), &part).unwrap();
        let mut session = Session::new(pgm, part, update_flags(&cli));
        let cancel = Arc::new(AtomicBool::new(false));
        let mut progress = BarProgress::new(true, Arc::clone(&cancel));
        program(&mut session, &db, &cli, &updates, &mut progress, &cancel).unwrap();
        session.finish(&mut progress).unwrap();
    }

    #[test]
    #[cfg(feature = "dummy")]
    fn test_soft_failure_continues_with_next_update() {
        let db = load_catalogue(&[]).unwrap();
        let part = db.find("m328p").unwrap().clone();
        let (cli, m) = parse(&["avrflash", "-U", "bootrow:w:1:m", "-U", "eeprom:w:0x5a:m"]);
        let updates = ordered_updates(&m).unwrap();
        let pgm = avrflash_prog::open("dummy", &ProgrammerOptions::default(), &part).unwrap();
        let mut session = Session::new(pgm, part, update_flags(&cli));
        let cancel = Arc::new(AtomicBool::new(false));
        let mut progress = BarProgress::new(true, Arc::clone(&cancel));
        program(&mut session, &db, &cli, &updates, &mut progress, &cancel).unwrap();
        let ee = session.part.memory_index("eeprom").unwrap();
        assert_eq!(session.read_byte(ee, 0).unwrap(), 0x5A);
        session.finish(&mut progress).unwrap();
    }

    #[test]
    #[cfg(feature = "dummy")]
    fn test_interrupt_stops_updates() {
        let db = load_catalogue(&[]).unwrap();
        let part = db.find("m328p").unwrap().clone();
        let (cli, m) = parse(&["avrflash", "-U", "eeprom:w:1:m"]);
        let updates = ordered_updates(&m).unwrap();
        let pgm = avrflash_prog::open("dummy", &ProgrammerOptions::default(), &part).unwrap();
        let mut session = Session::new(pgm, part, update_flags(&cli));
        let cancel = Arc::new(AtomicBool::new(true));
        let mut progress = BarProgress::new(true, Arc::clone(&cancel));
        assert!(program(&mut session, &db, &cli, &updates, &mut progress, &cancel).is_err());
    }
}
