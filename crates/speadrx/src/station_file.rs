//! Station-beam capture file sink
//!
//! Receives completed station-beam buffers and writes them to contiguous
//! binary files with fixed size cutoffs. Buffers arriving out of order are
//! placed at their proper offset: gaps ahead of a future buffer are
//! zero-filled, and a late buffer overwrites its zero placeholder. Nothing
//! is ever written across a file rotation.
//!
//! File names follow `channel_<first>_<count>_<unix_ts>.{dat,dada}`; an
//! optional 4096-byte ASCII DADA header precedes the data.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
#[cfg(not(test))]
use log::{info, warn};
#[cfg(test)]
use std::{println as info, println as warn};

use crate::error::DaqResult;
use crate::reassembly::station::{StationCallback, StationMetadata};
use crate::spead::SAMPLING_PERIOD;

/// Bytes per complex dual-polarisation sample frame of one channel
const CHANNEL_FRAME_BYTES: usize = 4;

/// Size of the optional DADA header block
const DADA_HEADER_SIZE: usize = 4096;

/// Capture sink settings
#[derive(Clone, Debug)]
pub struct CaptureFileConfig {
    /// Directory receiving the capture files
    pub directory: PathBuf,
    /// First logical channel captured
    pub start_channel: u16,
    /// Number of captured channels
    pub nof_channels: usize,
    /// Samples per buffer
    pub nof_samples: usize,
    /// File rotation threshold in bytes
    pub max_file_size: u64,
    /// One file per logical channel instead of a single combined file
    pub individual_channel_files: bool,
    /// Emit a DADA ASCII header at the head of every file
    pub dada_header: bool,
    /// Observed source name recorded in the DADA header
    pub source: String,
    /// Discard samples before this UTC epoch
    pub capture_start_time: Option<f64>,
}

impl Default for CaptureFileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            start_channel: 0,
            nof_channels: 1,
            nof_samples: 262144,
            max_file_size: 1024 * 1024 * 1024,
            individual_channel_files: false,
            dada_header: false,
            source: String::new(),
            capture_start_time: None,
        }
    }
}

/// Writes completed station-beam buffers to rotated capture files
pub struct StationFileWriter {
    config: CaptureFileConfig,
    files: Vec<File>,
    /// Buffers per file
    cutoff_counter: u64,
    /// Buffer counter at the head of the current file set
    file_base: Option<u64>,
    /// Next in-order buffer counter
    expected: u64,
    /// Bytes trimmed off the first buffer by capture-start alignment
    first_file_trim: u64,
    /// Buffers written (gap placeholders not counted)
    written_buffers: u64,
}

impl StationFileWriter {
    pub fn new(config: CaptureFileConfig) -> DaqResult<Self> {
        std::fs::create_dir_all(&config.directory)?;
        let buffer_bytes =
            (config.nof_samples * config.nof_channels * CHANNEL_FRAME_BYTES) as u64;
        let cutoff_counter = (config.max_file_size / buffer_bytes).max(1);
        Ok(Self {
            config,
            files: Vec::new(),
            cutoff_counter,
            file_base: None,
            expected: 0,
            first_file_trim: 0,
            written_buffers: 0,
        })
    }

    /// Buffers that made it to disk
    pub fn written_buffers(&self) -> u64 {
        self.written_buffers
    }

    /// Wrap the writer into a station-consumer callback
    ///
    /// Write failures are logged and capture continues; the filesystem is
    /// not allowed to take the receiver down.
    pub fn into_callback(mut self) -> StationCallback {
        Box::new(move |data, timestamp, metadata| {
            if let Err(err) = self.handle_buffer(data, timestamp, metadata) {
                warn!("failed to write station beam buffer: {err}");
            }
        })
    }

    /// Place one completed buffer into the capture files
    pub fn handle_buffer(
        &mut self,
        data: &[u8],
        timestamp: f64,
        metadata: &StationMetadata,
    ) -> std::io::Result<()> {
        let mut data = data;
        let mut timestamp = timestamp;

        // Capture-start alignment: drop whole early buffers, trim the one
        // the start time falls into
        if self.file_base.is_none() {
            if let Some(start_time) = self.config.capture_start_time {
                let buffer_end =
                    timestamp + self.config.nof_samples as f64 * SAMPLING_PERIOD;
                if buffer_end < start_time {
                    return Ok(());
                }
                if timestamp < start_time {
                    let skip_samples =
                        ((start_time - timestamp) / SAMPLING_PERIOD).round() as usize;
                    let skip_bytes =
                        skip_samples * self.config.nof_channels * CHANNEL_FRAME_BYTES;
                    if skip_bytes < data.len() {
                        data = &data[skip_bytes..];
                        timestamp += skip_samples as f64 * SAMPLING_PERIOD;
                        self.first_file_trim = skip_bytes as u64;
                    } else {
                        return Ok(());
                    }
                }
            }

            self.file_base = Some(metadata.buffer_counter);
            self.expected = metadata.buffer_counter;
            self.open_files(timestamp, metadata)?;
        }

        let mut file_base = self.file_base.expect("file set is open");

        // Rotate once the next in-order buffer belongs to a new file
        while self.expected - file_base >= self.cutoff_counter {
            file_base += self.cutoff_counter;
            self.file_base = Some(file_base);
            self.first_file_trim = 0;
            self.open_files(timestamp, metadata)?;
            info!("station capture rotated at buffer {}", self.expected);
        }

        // Late or future buffers outside the current file are dropped
        if metadata.buffer_counter < file_base
            || metadata.buffer_counter - file_base >= self.cutoff_counter
        {
            warn!(
                "dropping station buffer {} outside the current file ({}..{})",
                metadata.buffer_counter,
                file_base,
                file_base + self.cutoff_counter
            );
            return Ok(());
        }

        // Zero-fill placeholders for buffers the gap jumped over
        if metadata.buffer_counter > self.expected {
            for missing in self.expected..metadata.buffer_counter {
                self.write_slot(file_base, missing, None)?;
            }
            warn!(
                "zero-filled {} missing station buffer(s) before {}",
                metadata.buffer_counter - self.expected,
                metadata.buffer_counter
            );
        }

        self.write_slot(file_base, metadata.buffer_counter, Some(data))?;
        self.written_buffers += 1;

        // A late buffer overwrote its placeholder; expectations move only
        // forward
        if metadata.buffer_counter >= self.expected {
            self.expected = metadata.buffer_counter + 1;
        }
        Ok(())
    }

    /// Write one buffer (or a zero placeholder) at its slot offset
    fn write_slot(
        &mut self,
        file_base: u64,
        buffer_counter: u64,
        data: Option<&[u8]>,
    ) -> std::io::Result<()> {
        let slot = buffer_counter - file_base;
        let header = if self.config.dada_header {
            DADA_HEADER_SIZE as u64
        } else {
            0
        };

        if self.config.individual_channel_files {
            let channel_slot_bytes = (self.config.nof_samples * CHANNEL_FRAME_BYTES) as u64;
            let trim = self.first_file_trim / self.config.nof_channels as u64;
            let offset = header + (slot * channel_slot_bytes).saturating_sub(trim);

            let mut plane = vec![0u8; self.config.nof_samples * CHANNEL_FRAME_BYTES];
            for channel in 0..self.config.nof_channels {
                let plane = match data {
                    Some(data) => {
                        // de-interleave [sample][channel][pol] into one
                        // channel plane
                        let samples = data.len()
                            / (self.config.nof_channels * CHANNEL_FRAME_BYTES);
                        for sample in 0..samples {
                            let src = (sample * self.config.nof_channels + channel)
                                * CHANNEL_FRAME_BYTES;
                            plane[sample * CHANNEL_FRAME_BYTES
                                ..(sample + 1) * CHANNEL_FRAME_BYTES]
                                .copy_from_slice(&data[src..src + CHANNEL_FRAME_BYTES]);
                        }
                        &plane[..samples * CHANNEL_FRAME_BYTES]
                    }
                    None => &plane[..],
                };
                let file = &mut self.files[channel];
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(plane)?;
            }
        } else {
            let slot_bytes = (self.config.nof_samples
                * self.config.nof_channels
                * CHANNEL_FRAME_BYTES) as u64;
            let offset = header + (slot * slot_bytes).saturating_sub(self.first_file_trim);
            let zeros;
            let payload = match data {
                Some(data) => data,
                None => {
                    zeros = vec![0u8; slot_bytes as usize];
                    &zeros[..]
                }
            };
            let file = &mut self.files[0];
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(payload)?;
        }
        Ok(())
    }

    /// Close the current file set and open the next one
    fn open_files(
        &mut self,
        timestamp: f64,
        metadata: &StationMetadata,
    ) -> std::io::Result<()> {
        self.files.clear();

        let extension = if self.config.dada_header { "dada" } else { "dat" };
        let unix_timestamp = timestamp as u64;

        let channels: Vec<(u16, usize)> = if self.config.individual_channel_files {
            (0..self.config.nof_channels)
                .map(|c| (self.config.start_channel + c as u16, 1))
                .collect()
        } else {
            vec![(self.config.start_channel, self.config.nof_channels)]
        };

        for (first_channel, channels_in_file) in channels {
            let name = format!(
                "channel_{first_channel}_{channels_in_file}_{unix_timestamp}.{extension}"
            );
            let path = self.config.directory.join(name);
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            if self.config.dada_header {
                file.write_all(&self.dada_header(timestamp, metadata, channels_in_file))?;
            }
            info!("station capture writing to {}", path.display());
            self.files.push(file);
        }
        Ok(())
    }

    /// Render the fixed-size DADA ASCII header
    fn dada_header(
        &self,
        timestamp: f64,
        metadata: &StationMetadata,
        channels_in_file: usize,
    ) -> Vec<u8> {
        let utc_start = Utc
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .unwrap_or_default()
            .format("%Y-%m-%d-%H:%M:%S");
        let bandwidth_mhz = channels_in_file as f64 * (400.0 / 512.0);
        let frequency_mhz = metadata.frequency_hz as f64 / 1e6;

        let mut header = format!(
            "HDR_VERSION 1.0\n\
             HDR_SIZE {DADA_HEADER_SIZE}\n\
             TELESCOPE SKA-LOW\n\
             INSTRUMENT STATION-BEAM\n\
             SOURCE {}\n\
             FREQ {frequency_mhz:.6}\n\
             BW {bandwidth_mhz:.6}\n\
             NBIT 8\n\
             NPOL 2\n\
             NDIM 2\n\
             NCHAN {channels_in_file}\n\
             TSAMP {:.6}\n\
             UTC_START {utc_start}\n\
             OBS_OFFSET 0\n",
            self.config.source,
            SAMPLING_PERIOD * 1e6
        )
        .into_bytes();
        header.resize(DADA_HEADER_SIZE, 0);
        header
    }
}
