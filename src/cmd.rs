use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum RateAccuracy {
    /// Busy-wait on the monotonic clock; accurate, burns a CPU
    High,
    /// OS sleep; may over- or undersleep by milliseconds
    Low,
}

/// Replay a pcap file onto a live interface, honoring packet timestamps.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(help = "Network interface to transmit on")]
    pub interface: String,
    #[arg(help = "Pcap file with the packets to play")]
    pub pcap: String,
    #[arg(
        short,
        long,
        value_enum,
        default_value = "high",
        help = "Inter-packet delay accuracy"
    )]
    pub accuracy: RateAccuracy,
    #[arg(
        short,
        long,
        default_value_t = 1,
        help = "Play the packet list this many times"
    )]
    pub repeats: u64,
    #[arg(
        long,
        default_value = "0s",
        help = "Gap between repeats, e.g. \"10ms\" or \"2s\""
    )]
    pub repeat_delay: String,
    #[arg(
        short = 'l',
        long = "loop",
        default_value_t = false,
        help = "Loop the whole program until interrupted"
    )]
    pub loop_playback: bool,
    #[arg(long, default_value = "0s", help = "Gap before looping back")]
    pub loop_delay: String,
    #[arg(
        long,
        default_value_t = false,
        help = "Track per-stream transmit statistics from signature trailers"
    )]
    pub stream_stats: bool,
}
