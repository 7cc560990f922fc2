extern crate arrayvec;
extern crate chrono;
extern crate clap;
extern crate collect_slice;
extern crate crossbeam;
extern crate ctrlc;
extern crate fnv;
extern crate num;
extern crate rand;
extern crate serde;
extern crate serde_json;
extern crate thiserror;
extern crate tracing_subscriber;

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tracing_subscriber::EnvFilter;

mod cancel;
mod channel;
mod config;
mod consts;
mod convert;
mod duplex;
mod error;
mod sample;
mod sdr;
mod sim;
mod stream;

use cancel::Cancel;
use channel::{Channel, Direction};
use config::{Config, Task, Verbosity};
use consts::{CHANNEL_INDEX_MAX, READY_TIMEOUT_SECS};
use duplex::{Outcome, RxParams, SweepParams, TxParams};
use error::{Error, Result};
use sdr::{Correction, Device, Loopback, RxMux};
use stream::StreamConfig;

fn main() {
    let tune_args = || vec![
        Arg::with_name("channel")
            .short("c")
            .help("channel index")
            .value_name("CH")
            .default_value("0"),
        Arg::with_name("freq")
            .short("f")
            .help("center frequency (Hz)")
            .value_name("FREQ")
            .required(true),
        Arg::with_name("rate")
            .short("r")
            .help("sample rate (Hz)")
            .value_name("RATE")
            .default_value("2000000"),
        Arg::with_name("gain")
            .short("g")
            .help("gain (dB)")
            .value_name("GAIN")
            .allow_hyphen_values(true)
            .default_value("0"),
    ];

    let args = App::new("txrx")
        .about("coordinated IQ transmit/receive runs")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("device")
             .short("d")
             .help("device identifier (default: the only attached device)")
             .value_name("DEV"))
        .arg(Arg::with_name("verbosity")
             .short("v")
             .help("verbose|debug|info|warning|error|critical|silent")
             .value_name("LEVEL"))
        .subcommand(SubCommand::with_name("probe")
                    .about("list attached devices"))
        .subcommand(SubCommand::with_name("rx")
                    .about("capture samples to FILE")
                    .args(&tune_args())
                    .arg(Arg::with_name("num")
                         .short("n")
                         .help("samples to capture (0: until interrupted)")
                         .value_name("N")
                         .default_value("1000000"))
                    .arg(Arg::with_name("FILE").required(true)))
        .subcommand(SubCommand::with_name("tx")
                    .about("transmit samples from FILE")
                    .args(&tune_args())
                    .arg(Arg::with_name("repeat")
                         .short("R")
                         .help("passes over FILE")
                         .value_name("N")
                         .default_value("1"))
                    .arg(Arg::with_name("FILE").required(true)))
        .subcommand(SubCommand::with_name("txrx")
                    .about("sweep duplex runs over channel and frequency pairs")
                    .arg(Arg::with_name("rx-channel").long("rx-channel").value_name("LIST")
                         .default_value("0"))
                    .arg(Arg::with_name("tx-channel").long("tx-channel").value_name("LIST")
                         .default_value("0"))
                    .arg(Arg::with_name("rx-freq").long("rx-freq").value_name("LIST")
                         .required(true))
                    .arg(Arg::with_name("tx-freq").long("tx-freq").value_name("LIST")
                         .required(true))
                    .arg(Arg::with_name("rx-rate").long("rx-rate").value_name("RATE")
                         .default_value("2000000"))
                    .arg(Arg::with_name("tx-rate").long("tx-rate").value_name("RATE")
                         .default_value("2000000"))
                    .arg(Arg::with_name("rx-gain").long("rx-gain").value_name("GAIN")
                         .allow_hyphen_values(true).default_value("0"))
                    .arg(Arg::with_name("tx-gain").long("tx-gain").value_name("GAIN")
                         .allow_hyphen_values(true).default_value("0"))
                    .arg(Arg::with_name("num").short("n").value_name("N")
                         .help("samples to capture per iteration")
                         .default_value("1000000"))
                    .arg(Arg::with_name("repeat").short("R").value_name("N")
                         .help("passes over the TX file (below 1: until RX is done)")
                         .allow_hyphen_values(true).default_value("0"))
                    .arg(Arg::with_name("rx-file").long("rx-file").value_name("FILE")
                         .default_value("auto"))
                    .arg(Arg::with_name("report").long("report").value_name("FILE")
                         .help("write a JSON summary of every iteration"))
                    .arg(Arg::with_name("TX_FILE").required(true)))
        .subcommand(SubCommand::with_name("set")
                    .about("pass a setting through to the device driver")
                    .setting(AppSettings::SubcommandRequiredElseHelp)
                    .subcommand(SubCommand::with_name("loopback")
                                .about("select a loopback path")
                                .arg(Arg::with_name("MODE").required(true)))
                    .subcommand(SubCommand::with_name("rx-mux")
                                .about("select the RX sample source")
                                .arg(Arg::with_name("MUX").required(true)))
                    .subcommand(SubCommand::with_name("correction")
                                .about("apply an IQ correction to a channel")
                                .arg(Arg::with_name("channel")
                                     .short("c")
                                     .help("channel index")
                                     .value_name("CH")
                                     .default_value("0"))
                                .arg(Arg::with_name("tx")
                                     .long("tx")
                                     .help("correct the TX channel instead of RX"))
                                .arg(Arg::with_name("KIND")
                                     .help("dc_i|dc_q|phase|gain")
                                     .required(true))
                                .arg(Arg::with_name("VALUE")
                                     .allow_hyphen_values(true)
                                     .required(true))))
        .subcommand(SubCommand::with_name("run")
                    .about("execute the enabled sections of a JSON config")
                    .arg(Arg::with_name("CONFIG").required(true)))
        .subcommand(SubCommand::with_name("csv2bin")
                    .about("convert I, Q text lines to SC16Q11")
                    .arg(Arg::with_name("IN").required(true))
                    .arg(Arg::with_name("OUT").required(true)))
        .subcommand(SubCommand::with_name("bin2csv")
                    .about("convert SC16Q11 to I, Q text lines")
                    .arg(Arg::with_name("IN").required(true))
                    .arg(Arg::with_name("OUT").required(true)))
        .get_matches();

    let status = match dispatch(&args) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("txrx: {}", e);

            if e.is_retryable() {
                eprintln!("txrx: the transfer timed out and may succeed if retried");
            }

            e.status()
        },
    };

    std::process::exit(status);
}

fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    // Ignore a second init attempt.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

fn verbosity(args: &ArgMatches) -> Result<Option<Verbosity>> {
    match args.value_of("verbosity") {
        Some(s) => s.parse().map(Some),
        None => Ok(None),
    }
}

fn value<T: FromStr>(args: &ArgMatches, name: &str) -> Result<T> {
    let s = args.value_of(name).unwrap_or("");

    s.parse().map_err(|_| Error::Config(format!("invalid {} '{}'", name, s)))
}

/// Parse an integer option that may be written in float notation, such as `915e6`.
fn number(args: &ArgMatches, name: &str) -> Result<u64> {
    let list = config::parse_list(args.value_of(name).unwrap_or(""))?;

    match list.len() {
        1 => Ok(list[0]),
        _ => Err(Error::Config(format!("{} takes a single value", name))),
    }
}

fn list(args: &ArgMatches, name: &str) -> Result<Vec<u64>> {
    config::parse_list(args.value_of(name).unwrap_or(""))
}

fn channels(args: &ArgMatches, name: &str) -> Result<Vec<u32>> {
    list(args, name)?.into_iter()
        .map(|c| if c <= CHANNEL_INDEX_MAX as u64 {
            Ok(c as u32)
        } else {
            Err(Error::Config(format!("invalid channel {}", c)))
        })
        .collect()
}

fn rate(args: &ArgMatches, name: &str) -> Result<u32> {
    let hz = number(args, name)?;

    if hz > u32::max_value() as u64 {
        return Err(Error::Config(format!("invalid {} {}", name, hz)));
    }

    Ok(hz as u32)
}

fn dispatch(args: &ArgMatches) -> Result<i32> {
    let level = verbosity(args)?;
    let ident = args.value_of("device").unwrap_or("");

    if let ("run", Some(m)) = args.subcommand() {
        let cfg = Config::load(Path::new(m.value_of("CONFIG").unwrap_or("")))?;
        init_logging(level.unwrap_or(cfg.verbosity));

        let ident = if ident.is_empty() { &cfg.device[..] } else { ident };
        let dev = sdr::open(ident)?;

        return run_config(&cfg, &*dev, &Cancel::on_ctrlc()?);
    }

    init_logging(level.unwrap_or_default());

    match args.subcommand() {
        ("probe", _) => {
            for (idx, d) in sdr::devices().iter().enumerate() {
                println!("{}: {}", idx, d);
            }

            Ok(0)
        },
        ("rx", Some(m)) => {
            let ch = Channel::checked(Direction::Rx, value(m, "channel")?)?;
            let params = RxParams::new(ch, number(m, "freq")?, rate(m, "rate")?,
                                       value(m, "gain")?, number(m, "num")?);
            let dev = sdr::open(ident)?;
            let report = duplex::run_rx(&*dev, params, Path::new(m.value_of("FILE").unwrap_or("")),
                                        None, None, &Cancel::on_ctrlc()?)?;

            println!("received {} samples in {} transfers at {} Hz", report.samples,
                     report.transfers, report.sample_rate);

            Ok(0)
        },
        ("tx", Some(m)) => {
            let ch = Channel::checked(Direction::Tx, value(m, "channel")?)?;
            let params = TxParams::new(ch, number(m, "freq")?, rate(m, "rate")?,
                                       value(m, "gain")?, value(m, "repeat")?);
            let dev = sdr::open(ident)?;
            let report = duplex::run_tx(&*dev, params, Path::new(m.value_of("FILE").unwrap_or("")),
                                        None, None, &Cancel::on_ctrlc()?)?;

            println!("transmitted {} samples in {} passes ({} transfers)", report.samples,
                     report.passes, report.transfers);

            Ok(0)
        },
        ("txrx", Some(m)) => {
            let params = SweepParams {
                rx_sample_rate: rate(m, "rx-rate")?,
                rx_gain: value(m, "rx-gain")?,
                rx_num_samples: number(m, "num")?,
                rx_file: m.value_of("rx-file").unwrap_or("auto").to_string(),
                tx_sample_rate: rate(m, "tx-rate")?,
                tx_gain: value(m, "tx-gain")?,
                tx_repeats: value(m, "repeat")?,
                tx_file: m.value_of("TX_FILE").unwrap_or("").into(),
                stream: StreamConfig::default(),
                ready_timeout: std::time::Duration::from_secs(READY_TIMEOUT_SECS),
            };

            let rx_channels = channels(m, "rx-channel")?;
            let tx_channels = channels(m, "tx-channel")?;
            let rx_freqs = list(m, "rx-freq")?;
            let tx_freqs = list(m, "tx-freq")?;

            let dev = sdr::open(ident)?;
            let outcomes = duplex::run_duplex_sweep(&*dev, &*dev, (&rx_channels, &tx_channels),
                                                    (&rx_freqs, &tx_freqs), params,
                                                    &Cancel::on_ctrlc()?)?;

            if let Some(path) = m.value_of("report") {
                write_report(Path::new(path), &outcomes)?;
            }

            Ok(print_outcomes("txrx", &outcomes))
        },
        ("set", Some(m)) => {
            let dev = sdr::open(ident)?;

            match m.subcommand() {
                ("loopback", Some(a)) =>
                    dev.set_loopback(a.value_of("MODE").unwrap_or("").parse::<Loopback>()?)?,
                ("rx-mux", Some(a)) =>
                    dev.set_rx_mux(a.value_of("MUX").unwrap_or("").parse::<RxMux>()?)?,
                ("correction", Some(a)) => {
                    let dir = if a.is_present("tx") { Direction::Tx } else { Direction::Rx };
                    let ch = sdr::check_channel(&*dev,
                                                Channel::checked(dir, value(a, "channel")?)?)?;
                    let kind = a.value_of("KIND").unwrap_or("").parse::<Correction>()?;

                    dev.set_correction(ch, kind, value(a, "VALUE")?)?
                },
                _ => return Err(Error::Config("no setting given".to_string())),
            }

            Ok(0)
        },
        ("csv2bin", Some(m)) => {
            let src = BufReader::new(File::open(m.value_of("IN").unwrap_or(""))?);
            let mut dst = BufWriter::new(File::create(m.value_of("OUT").unwrap_or(""))?);
            let stats = convert::csv_to_bin(src, &mut dst)?;

            println!("wrote {} samples ({} values clamped)", stats.samples, stats.clamped);

            Ok(0)
        },
        ("bin2csv", Some(m)) => {
            let mut src = BufReader::new(File::open(m.value_of("IN").unwrap_or(""))?);
            let mut dst = BufWriter::new(File::create(m.value_of("OUT").unwrap_or(""))?);
            let samples = convert::bin_to_csv(&mut src, &mut dst)?;

            println!("wrote {} samples", samples);

            Ok(0)
        },
        _ => Err(Error::Config("no command given".to_string())),
    }
}

fn write_report(path: &Path, outcomes: &[Outcome]) -> Result<()> {
    let summaries = outcomes.iter().map(Outcome::summary).collect::<Vec<_>>();
    serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &summaries)?;

    Ok(())
}

/// Print one status line per iteration, returning the first failing status.
fn print_outcomes(name: &str, outcomes: &[Outcome]) -> i32 {
    let mut status = 0;

    for o in outcomes {
        let it = &o.iteration;
        let label = format!("{} r{}t{} {}/{}", name, it.rx_channel, it.tx_channel,
                            it.rx_frequency, it.tx_frequency);

        match o.status() {
            0 => println!("{:<35} : Success", label),
            s => {
                println!("{:<35} : Failure ({})", label, s);

                if status == 0 {
                    status = s;
                }
            },
        }
    }

    status
}

/// Run every enabled section in file order, continuing past failures.
fn run_config(cfg: &Config, dev: &dyn Device, cancel: &Cancel) -> Result<i32> {
    let mut status = 0;

    for s in &cfg.sections {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        if !s.enable {
            println!("{:<35} : Skipped", s.name);
            continue;
        }

        let res = match s.task {
            Task::Tx(ref tx) => tx.params(cfg)
                .and_then(|p| duplex::run_tx(dev, p, &tx.tx_file, None, None, cancel))
                .map(|_| 0),
            Task::Rx(ref rx) => rx.params(cfg)
                .and_then(|p| duplex::run_rx(dev, p, &rx.rx_file, None, None, cancel))
                .map(|_| 0),
            Task::Txrx(ref sweep) =>
                sweep.sweep(cfg).map(|sw| print_outcomes(&s.name, &sw.run(dev, dev, cancel))),
        };

        let res_ok = res.is_ok();

        let code = match res {
            Ok(code) => code,
            Err(e) => {
                error!("{}: {}", s.name, e);
                e.status()
            },
        };

        // Sweeps report each iteration themselves.
        let summarized = match s.task {
            Task::Txrx(_) => res_ok,
            _ => false,
        };

        if !summarized {
            match code {
                0 => println!("{:<35} : Success", s.name),
                c => println!("{:<35} : Failure ({})", s.name, c),
            }
        }

        if status == 0 {
            status = code;
        }
    }

    Ok(status)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use crate::error::StatusCode;
    use crate::sim::{SimDevice, NOISE_LEVEL};

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("txrx-main-{}-{}", std::process::id(), name))
    }

    fn rx_section(name: &str, freq: u64, samples: u64, file: &Path) -> String {
        format!(r#"{{"name": "{}", "mode": "rx", "rx_channel": 0, "rx_frequency": {},
                    "rx_samplerate": 2000000, "rx_gain": 30, "rx_num_samples": {},
                    "rx_file": {:?}}}"#, name, freq, samples, file.to_str().unwrap())
    }

    fn tx_section(name: &str, enable: bool, repeats: i32, file: &Path) -> String {
        format!(r#"{{"name": "{}", "mode": "tx", "enable": {}, "tx_channel": 0,
                    "tx_frequency": 915000000, "tx_samplerate": 2000000, "tx_gain": 10,
                    "tx_repeats": {}, "tx_file": {:?}}}"#,
                name, enable, repeats, file.to_str().unwrap())
    }

    fn sweep_section(name: &str, rx_file: &Path, tx_file: &Path) -> String {
        format!(r#"{{"name": "{}", "mode": "txrx", "rx_channel": [0], "tx_channel": [1],
                    "rx_frequency": [915000000], "tx_frequency": [915000000],
                    "rx_samplerate": 2000000, "rx_gain": 30, "rx_num_samples": 2048,
                    "rx_file": {:?}, "tx_samplerate": 2000000, "tx_gain": 10,
                    "tx_repeats": 0, "tx_file": {:?}}}"#,
                name, rx_file.to_str().unwrap(), tx_file.to_str().unwrap())
    }

    fn config(sections: &[String]) -> Config {
        let text = format!(r#"{{"ready_timeout": 5, "sections": [{}]}}"#, sections.join(","));
        Config::from_reader(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_run_config_continues_past_failure() {
        let dev = SimDevice::new().with_noise(NOISE_LEVEL);
        let missing = tmp("missing-tx.bin");
        let bad = tmp("bad-rx.bin");
        let cap = tmp("good-rx.bin");
        let burst = tmp("burst.bin");
        let swept = tmp("swept-rx.bin");

        fs::write(&burst, vec![3u8; 1024 * 4]).unwrap();

        let cfg = config(&[
            tx_section("skipped", false, 1, &missing),
            rx_section("bad", 10, 1024, &bad),
            rx_section("good", 915_000_000, 2048, &cap),
            sweep_section("sweep", &swept, &burst),
        ]);

        let status = run_config(&cfg, &dev, &Cancel::new()).unwrap();

        // The first failure decides the status; later sections still ran.
        assert_eq!(status, StatusCode::Inval.raw());
        assert_eq!(fs::metadata(&cap).unwrap().len(), 2048 * 4);
        assert_eq!(fs::metadata(&swept).unwrap().len(), 2048 * 4);

        for f in &[&bad, &cap, &burst, &swept] {
            fs::remove_file(f).ok();
        }
    }

    #[test]
    fn test_run_config_success() {
        let dev = SimDevice::new().with_noise(NOISE_LEVEL);
        let burst = tmp("ok-burst.bin");
        let cap = tmp("ok-rx.bin");

        fs::write(&burst, vec![1u8; 1500 * 4]).unwrap();

        let cfg = config(&[
            tx_section("burst", true, 2, &burst),
            rx_section("capture", 915_000_000, 1000, &cap),
        ]);

        assert_eq!(run_config(&cfg, &dev, &Cancel::new()).unwrap(), 0);
        assert_eq!(fs::metadata(&cap).unwrap().len(), 1000 * 4);

        let cancel = Cancel::new();
        cancel.cancel();

        assert!(match run_config(&cfg, &dev, &cancel) {
            Err(Error::Interrupted) => true,
            _ => false,
        });

        fs::remove_file(&burst).ok();
        fs::remove_file(&cap).ok();
    }

    #[test]
    fn test_sweep_validation_fails_section() {
        let dev = SimDevice::new().with_noise(NOISE_LEVEL);
        let burst = tmp("val-burst.bin");
        let cap = tmp("val-rx.bin");

        let mismatched = sweep_section("sweep", &cap, &burst)
            .replace("\"tx_channel\": [1]", "\"tx_channel\": [1, 0]");
        let cfg = config(&[mismatched]);

        assert_eq!(run_config(&cfg, &dev, &Cancel::new()).unwrap(), StatusCode::Inval.raw());
        assert!(!cap.exists());
    }
}
