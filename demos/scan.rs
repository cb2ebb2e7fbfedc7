//! BACnet Network Scan
//!
//! Discovers the devices reachable from this host, then probes and
//! enumerates every one of them through the session's worker pool.
//!
//! ```text
//! cargo run --example scan -- [target] [--sweep] [--window SECS] [--bbmd HOST:PORT]
//! ```
//!
//! `target` is a device address (`192.168.1.20`, `10.0.0.5/2001:0a`) or
//! omitted for a local broadcast. Set `RUST_LOG=debug` for engine logs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bacnet_recon::device::{DeviceAddress, Target};
use bacnet_recon::listener::SurveyReport;
use bacnet_recon::transport::bip::{BacnetIpConfig, BacnetIpTransport, ForeignDeviceConfig};
use bacnet_recon::{ReconConfig, Session};

struct Options {
    target: Target,
    sweep: bool,
    window: Duration,
    bbmd: Option<SocketAddr>,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} [target] [--sweep] [--window SECS] [--bbmd HOST:PORT]",
        program
    );
    eprintln!("Example: {} 10.161.1.211 --window 10", program);
    std::process::exit(1);
}

fn parse_args() -> Result<Options, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "scan".to_string());
    let mut options = Options {
        target: Target::Broadcast,
        sweep: false,
        window: Duration::from_secs(5),
        bbmd: None,
    };

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--help" | "-h" => usage(&program),
            "--sweep" => options.sweep = true,
            "--window" => {
                let Some(secs) = rest.next() else { usage(&program) };
                options.window = Duration::from_secs(secs.parse()?);
            }
            "--bbmd" => {
                let Some(bbmd) = rest.next() else { usage(&program) };
                options.bbmd = Some(bbmd.parse()?);
            }
            address => options.target = Target::Address(address.parse::<DeviceAddress>()?),
        }
    }
    Ok(options)
}

fn print_report(report: &SurveyReport) {
    let profile = &report.profile;
    println!("Device {}", report.announcement.identity);
    println!("  Name:       {}", profile.device_name().unwrap_or("?"));
    println!("  Outcome:    {:?}", profile.outcome());
    println!(
        "  Max APDU:   {} ({:?})",
        profile.max_apdu(),
        profile.segmentation()
    );
    println!("  Latency:    {:.1} ms", profile.average_latency_ms());
    match &report.objects {
        Ok(list) => {
            println!(
                "  Objects:    {} via {}{}",
                list.objects.len(),
                list.strategy_used,
                if list.is_complete() { "" } else { " (incomplete)" }
            );
            if !list.failed_indices.is_empty() {
                println!("  Failed:     {:?}", list.failed_indices);
            }
            for object in &list.objects {
                println!("    {}", object);
            }
        }
        Err(e) => println!("  Objects:    {}", e),
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let options = parse_args()?;

    println!("BACnet Network Scan");
    println!("===================\n");

    let mut ip_config = BacnetIpConfig::default();
    if let Some(bbmd) = options.bbmd {
        println!("Registering as foreign device with {}", bbmd);
        ip_config.foreign_device = Some(ForeignDeviceConfig::new(bbmd));
    }
    let transport = BacnetIpTransport::bind(ip_config).await?;
    println!("Listening on {}", transport.local_addr()?);

    let session = Session::new(Arc::new(transport), ReconConfig::default())?;
    let cancel = session.cancel_token().clone();
    ctrlc::set_handler(move || cancel.cancel())?;

    let mut channels = session.start()?;

    let devices = if options.sweep {
        println!("Sweeping common instance ranges at {}...\n", options.target);
        session.sweep(options.target, &[], options.window).await?
    } else {
        println!("Who-Is to {}...\n", options.target);
        session
            .discover(options.target, None, options.window)
            .await?
            .collect()
            .await
    };
    println!("Found {} devices, surveying (Ctrl+C to stop)\n", devices.len());

    let mut pending: HashSet<u32> = devices.iter().map(|device| device.instance).collect();
    let cancel = session.cancel_token().clone();
    while !pending.is_empty() {
        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = channels.reports.recv() => report,
        };
        let Some(report) = report else {
            break;
        };
        pending.remove(&report.announcement.identity.instance);
        print_report(&report);
    }

    session.shutdown().await;
    println!("Scan finished, {} devices known", session.cache().len());
    Ok(())
}
