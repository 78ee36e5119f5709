use crossbeam::channel::{Receiver, Sender};
use crossbeam::select;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::shutdown::{Shutdown, StageToken};
use crate::radar::cluster::Clusterer;
use crate::radar::framer::PacketFramer;
use crate::radar::heatmap::AzimuthHeatmapProcessor;
use crate::radar::packet;
use crate::radar::{ClusteredObject, Packet, RadarError, Statistics};
use crate::recording::PacketSink;
use crate::sensor::{ByteSource, SourceRead};

const READ_BUFFER_LENGTH: usize = 16 * 1024;

/// What each loop of a run reports about itself. Set when the run starts,
/// each loop clears its own on exit.
#[derive(Debug, Default)]
pub struct PipelineFlags {
    pub reading: AtomicBool,
    pub framing: AtomicBool,
    pub active_workers: AtomicUsize,
}

impl PipelineFlags {
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub fn is_framing(&self) -> bool {
        self.framing.load(Ordering::Acquire)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }
}

/// The source handed back by the reader thread, with the first error the
/// source reported while reading or stopping
pub(crate) type ReadOutcome = (Box<dyn ByteSource>, Result<(), RadarError>);

///
/// Moves bytes from the source to the raw channel until told to stop, the
/// source runs dry or fails. On a regular stop whatever the source still
/// holds is passed on as well. Returns the source, stopped.
///
pub(crate) fn read_loop(
    mut source: Box<dyn ByteSource>,
    raw_tx: Sender<Vec<u8>>,
    stop_reading: Shutdown,
    abort: Shutdown,
    flags: Arc<PipelineFlags>,
    _token: Option<StageToken>,
) -> ReadOutcome {
    let name = source.name();
    info!("{}: reading", name);

    let mut result = Ok(());
    let mut buf = vec![0u8; READ_BUFFER_LENGTH];
    let mut channel_open = true;
    loop {
        if stop_reading.is_triggered() || abort.is_triggered() {
            break;
        }
        match source.read(&mut buf) {
            Ok(SourceRead::Bytes(n)) => {
                trace!("{}: {} bytes", name, n);
                if raw_tx.send(buf[..n].to_vec()).is_err() {
                    error!("{}: {}", name, RadarError::ChannelClosed("raw bytes"));
                    channel_open = false;
                    break;
                }
            }
            Ok(SourceRead::Idle) => {}
            Ok(SourceRead::Finished) => {
                info!("{}: end of data", name);
                break;
            }
            Err(e) => {
                error!("{}: read failed: {}", name, e);
                result = Err(e);
                break;
            }
        }
    }

    if channel_open && result.is_ok() && !abort.is_triggered() {
        match source.drain() {
            Ok(rest) if !rest.is_empty() => {
                debug!("{}: {} bytes left after stop", name, rest.len());
                if raw_tx.send(rest).is_err() {
                    warn!("{}: {}", name, RadarError::ChannelClosed("raw bytes"));
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("{}: cannot read remaining bytes: {}", name, e);
                result = Err(e);
            }
        }
    }
    if let Err(e) = source.stop() {
        error!("{}: stop failed: {}", name, e);
        if result.is_ok() {
            result = Err(e);
        }
    }

    flags.reading.store(false, Ordering::Release);
    info!("{}: reading stopped", name);
    (source, result)
}

/// Cuts the raw byte chunks into packets until the raw channel is closed
/// and empty, or the run is aborted.
pub(crate) fn frame_loop(
    raw_rx: Receiver<Vec<u8>>,
    packet_tx: Sender<Packet>,
    abort: Shutdown,
    statistics: Arc<Statistics>,
    flags: Arc<PipelineFlags>,
    _token: Option<StageToken>,
) {
    debug!("Framer started");
    let mut framer = PacketFramer::new();

    'outer: loop {
        if abort.is_triggered() {
            break;
        }
        let bytes = select! {
            recv(raw_rx) -> bytes => match bytes {
                Ok(bytes) => bytes,
                Err(_) => break,
            },
            recv(abort.receiver()) -> _ => break,
        };

        let dropped = framer.bytes_dropped();
        let packets = framer.feed(&bytes);
        Statistics::add(&statistics.bytes_dropped, framer.bytes_dropped() - dropped);
        Statistics::add(&statistics.packets_framed, packets.len() as u64);

        for packet in packets {
            if packet_tx.send(packet).is_err() {
                error!("Framer: {}", RadarError::ChannelClosed("packets"));
                break 'outer;
            }
        }
    }

    if framer.buffered() > 0 {
        debug!("Framer stopped with {} bytes of a partial packet", framer.buffered());
    }
    flags.framing.store(false, Ordering::Release);
    debug!("Framer stopped");
}

/// Heatmap and clustering of a single packet
pub fn process_packet(
    processor: &mut AzimuthHeatmapProcessor,
    clusterer: &Clusterer,
    packet: &Packet,
) -> Result<Option<ClusteredObject>, RadarError> {
    let (header, tlvs) = packet::parse(packet)?;
    let Some(tlv) = packet::last_azimuth_heatmap(tlvs) else {
        trace!("Frame {} without azimuth heatmap", header.frame_num);
        return Ok(None);
    };
    let points = processor.process(tlv.payload)?;
    Ok(clusterer.cluster(&points, packet.received_at))
}

pub(crate) struct WorkerContext {
    pub clusterer: Clusterer,
    pub packet_rx: Receiver<Packet>,
    pub cluster_tx: Option<Sender<ClusteredObject>>,
    pub save_tx: Option<Sender<Packet>>,
    pub sink: Option<Arc<dyn PacketSink>>,
    pub abort: Shutdown,
    pub statistics: Arc<Statistics>,
    pub flags: Arc<PipelineFlags>,
}

pub(crate) fn work_loop(id: usize, ctx: WorkerContext, _token: Option<StageToken>) {
    debug!("Worker {} started", id);
    let mut processor = AzimuthHeatmapProcessor::new();

    loop {
        if ctx.abort.is_triggered() {
            break;
        }
        let packet = select! {
            recv(ctx.packet_rx) -> packet => match packet {
                Ok(packet) => packet,
                Err(_) => break,
            },
            recv(ctx.abort.receiver()) -> _ => break,
        };

        let result = process_packet(&mut processor, &ctx.clusterer, &packet);
        if let Some(save_tx) = &ctx.save_tx {
            if save_tx.send(packet).is_err() {
                warn!("Worker {}: packet saver has stopped", id);
            }
        }

        let cluster = match result {
            Ok(cluster) => cluster,
            Err(e) => {
                debug!("Worker {}: broken packet: {}", id, e);
                Statistics::add(&ctx.statistics.broken_packets, 1);
                continue;
            }
        };
        Statistics::add(&ctx.statistics.packets_processed, 1);

        let Some(cluster) = cluster else {
            continue;
        };
        trace!("Worker {}: {}", id, cluster);
        Statistics::add(&ctx.statistics.clusters_emitted, 1);

        if let Some(cluster_tx) = &ctx.cluster_tx {
            if cluster_tx.send(cluster.clone()).is_err() {
                error!("Worker {}: {}", id, RadarError::ChannelClosed("clusters"));
                break;
            }
        }
        if let Some(sink) = &ctx.sink {
            if !sink.save_clusters(std::slice::from_ref(&cluster)) {
                Statistics::add(&ctx.statistics.save_failures, 1);
            }
        }
    }

    ctx.flags.active_workers.fetch_sub(1, Ordering::AcqRel);
    debug!("Worker {} stopped", id);
}

/// Writes the raw packets handed over by the workers
pub(crate) fn save_loop(
    save_rx: Receiver<Packet>,
    sink: Arc<dyn PacketSink>,
    abort: Shutdown,
    statistics: Arc<Statistics>,
    _token: Option<StageToken>,
) {
    debug!("Packet saver started");
    loop {
        let packet = select! {
            recv(save_rx) -> packet => match packet {
                Ok(packet) => packet,
                Err(_) => break,
            },
            recv(abort.receiver()) -> _ => break,
        };
        if sink.save_packet(&packet.payload, packet.received_at) {
            Statistics::add(&statistics.packets_saved, 1);
        } else {
            Statistics::add(&statistics.save_failures, 1);
        }
    }
    debug!("Packet saver stopped");
}
