use std::fs::File;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use pcap_file::pcap::PcapReader;

use wireplay::clock::Accuracy;
use wireplay::engine::TxEngine;
use wireplay::sink::DatalinkSink;
use wireplay::stats::StatsLedger;

mod cmd;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cmd::Args::parse();
    if let Err(e) = run(&args) {
        log::error!("{e}");
        process::exit(1);
    }
}

fn run(args: &cmd::Args) -> Result<(), Box<dyn std::error::Error>> {
    let repeat_delay = humantime::parse_duration(&args.repeat_delay)?;
    let loop_delay = humantime::parse_duration(&args.loop_delay)?;

    let packets = load_pcap(&args.pcap)?;
    if packets.is_empty() {
        log::warn!("{} holds no packets", args.pcap);
        return Ok(());
    }
    log::info!("loaded {} packets from {}", packets.len(), args.pcap);

    let sink = DatalinkSink::open(&args.interface)?;
    let stats = Arc::new(StatsLedger::default());
    let mut engine = TxEngine::new(sink, Arc::clone(&stats));

    engine.set_rate_accuracy(match args.accuracy {
        cmd::RateAccuracy::High => Accuracy::High,
        cmd::RateAccuracy::Low => Accuracy::Low,
    })?;
    engine.set_stream_stats_tracking(args.stream_stats);

    // One packet set holding the whole file, timestamps made relative to the
    // first packet.
    let base = packets[0].0;
    engine.loop_next_packet_set(
        packets.len() as u64,
        args.repeats,
        repeat_delay.as_secs() as i64,
        i64::from(repeat_delay.subsec_nanos()),
    );
    for (ts, data) in &packets {
        let rel = ts.saturating_sub(base);
        if !engine.append_to_packet_list(rel.as_secs() as i64, i64::from(rel.subsec_nanos()), data)
        {
            log::error!("packet of {} bytes does not fit a send buffer", data.len());
            process::exit(1);
        }
    }
    if args.loop_playback {
        engine.set_packet_list_loop_mode(
            true,
            loop_delay.as_secs() as i64,
            i64::from(loop_delay.subsec_nanos()),
        );
        log::info!("looping until interrupted");
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))?;

    engine.start()?;
    while engine.is_running() {
        if interrupted.load(Ordering::Relaxed) {
            let _ = engine.stop();
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    engine.wait();

    log::info!(
        "sent {} packets / {} bytes in {:.6}s",
        stats.pkts(),
        stats.bytes(),
        engine.last_tx_duration()
    );
    if args.stream_stats {
        for (guid, s) in engine.stream_stats() {
            log::info!(
                "stream {guid:#010x}: {} pkts / {} bytes",
                s.tx_pkts,
                s.tx_bytes
            );
        }
    }
    Ok(())
}

fn load_pcap(path: &str) -> Result<Vec<(Duration, Vec<u8>)>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = PcapReader::new(file)?;
    let mut packets = Vec::new();
    while let Some(packet) = reader.next_packet() {
        let packet = packet?;
        packets.push((packet.timestamp, packet.data.into_owned()));
    }
    Ok(packets)
}
