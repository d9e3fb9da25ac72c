//! The sub-observation lifecycle engine: decides per header whether to
//! start a new observation, continue the current one, skip an in-progress
//! one, or roll the output file, and dispatches each integration into the
//! visibility and weights HDUs.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use mwax_db2fits_common::client::{Acceptance, RingClient};
use tracing::{debug, info, warn};

use crate::{
    error::DbfitsError,
    fits::FitsWriter,
    header::{Mode, SubobsHeader},
    health::SharedHealth,
    shutdown::Shutdown,
    weights,
};

/// Writer-private state of the observation currently on disk.
struct CurrentObs {
    header: SubobsHeader,
    fits: FitsWriter,
    file_number: u32,
    /// Stamped on every image HDU, advancing per HDU (visibilities get an
    /// even marker, the paired weights the following odd one).
    marker: i64,
    /// `OBS_OFFSET` of the sub-observation being written.
    obs_offset: i32,
    unix_time: u64,
    unix_time_msec: i32,
}

#[derive(Default)]
enum ObsState {
    #[default]
    Idle,
    /// The first header of this observation arrived mid-observation, so the
    /// whole observation is discarded.
    Skipping { obs_id: u64 },
    InObs(Box<CurrentObs>),
}

/// The ring buffer client: owns the observation state machine, the open
/// FITS file and the weight accumulation feed.
pub struct DbfitsClient {
    dest_dir: PathBuf,
    file_size_limit: u64,
    hostname: String,
    shutdown: Shutdown,
    health: Arc<Mutex<SharedHealth>>,
    state: ObsState,
}

impl DbfitsClient {
    #[must_use]
    pub fn new(
        dest_dir: PathBuf,
        file_size_limit: u64,
        hostname: String,
        shutdown: Shutdown,
        health: Arc<Mutex<SharedHealth>>,
    ) -> Self {
        Self {
            dest_dir,
            file_size_limit,
            hostname,
            shutdown,
            health,
            state: ObsState::Idle,
        }
    }

    /// Close whatever is open. Used on observation end, mode change, fatal
    /// errors and shutdown; the rename to `.fits` is best-effort.
    pub fn close_current(&mut self) {
        if let ObsState::InObs(cur) = std::mem::take(&mut self.state) {
            self.finish_obs(cur);
        }
    }

    fn finish_obs(&mut self, cur: Box<CurrentObs>) {
        info!(
            "observation {}: closing after {} HDUs across {} file(s)",
            cur.header.obs_id,
            cur.marker,
            cur.file_number + 1
        );
        cur.fits.close();
        self.state = ObsState::Idle;

        let mut h = self.health.lock().expect("health mutex poisoned");
        h.obs_id = 0;
        h.subobs_id = 0;
    }

    fn update_health_ids(&self, obs_id: u64, subobs_id: u64, ntiles: usize) {
        let mut h = self.health.lock().expect("health mutex poisoned");
        h.obs_id = obs_id;
        h.subobs_id = subobs_id;
        h.ntiles = ntiles;
    }

    fn log_new_observation(hdr: &SubobsHeader) {
        info!("OBS_ID:              {}", hdr.obs_id);
        info!("SUBOBS_ID:           {}", hdr.subobs_id);
        info!("UTC_START:           {}", hdr.utc_start.compact());
        info!("PROJ_ID:             {}", hdr.proj_id);
        info!("EXPOSURE_SECS:       {} sec", hdr.exposure_secs);
        info!("COARSE_CHANNEL:      {}", hdr.coarse_channel);
        info!("CORR_COARSE_CHANNEL: {}", hdr.corr_coarse_channel);
        info!("NINPUTS:             {}", hdr.ninputs);
        info!("NBASELINES:          {}", hdr.nbaselines());
        info!("NPOL:                {}", hdr.npol);
        info!("NBIT:                {}", hdr.nbit);
        info!("NFINE_CHAN:          {}", hdr.nfine_chan);
        info!("FINE_CHAN_WIDTH_HZ:  {} Hz", hdr.fine_chan_width_hz);
        info!("BANDWIDTH_HZ:        {} Hz", hdr.bandwidth_hz);
        info!("INT_TIME_MSEC:       {} msec", hdr.int_time_msec);
        info!("SECS_PER_SUBOBS:     {} sec", hdr.secs_per_subobs);
        info!("TRANSFER_SIZE:       {} bytes", hdr.transfer_size);
    }

    /// First sight of an observation id: start it if this is its first
    /// sub-observation, otherwise mark the whole observation as skipped.
    fn start_or_skip(&mut self, hdr: SubobsHeader) -> Result<Acceptance, DbfitsError> {
        if hdr.obs_id != hdr.subobs_id {
            info!(
                "observation {} is already in progress (subobs {}), skipping it entirely",
                hdr.obs_id, hdr.subobs_id
            );
            self.state = ObsState::Skipping { obs_id: hdr.obs_id };
            return Ok(Acceptance::Accept);
        }

        hdr.validate()?;
        info!("new observation detected:");
        Self::log_new_observation(&hdr);

        let fits = FitsWriter::create(
            &self.dest_dir,
            &hdr,
            0,
            0,
            hdr.unix_time,
            hdr.unix_time_msec,
            &self.hostname,
        )?;

        self.update_health_ids(hdr.obs_id, hdr.subobs_id, hdr.ntiles() as usize);

        self.state = ObsState::InObs(Box::new(CurrentObs {
            obs_offset: hdr.obs_offset,
            unix_time: hdr.unix_time,
            unix_time_msec: hdr.unix_time_msec,
            marker: 0,
            file_number: 0,
            fits,
            header: hdr,
        }));
        Ok(Acceptance::Accept)
    }

    /// A further sub-observation of the observation we are writing.
    fn continue_obs(
        &mut self,
        mut cur: Box<CurrentObs>,
        hdr: SubobsHeader,
    ) -> Result<Acceptance, DbfitsError> {
        if let Err(e) = hdr.validate() {
            self.finish_obs(cur);
            return Err(e);
        }

        if !hdr.same_observation_shape(&cur.header) {
            warn!(
                "observation {}: header fields changed mid-observation, treating as a new observation",
                hdr.obs_id
            );
            self.finish_obs(cur);
            return self.start_or_skip(hdr);
        }

        let expected = cur.obs_offset + cur.header.secs_per_subobs;
        if hdr.obs_offset <= cur.obs_offset || hdr.obs_offset != expected {
            let err = DbfitsError::OffsetNotContiguous {
                obs_id: hdr.obs_id,
                expected,
                got: hdr.obs_offset,
                secs_per_subobs: cur.header.secs_per_subobs,
            };
            self.finish_obs(cur);
            return Err(err);
        }

        if hdr.exposure_secs != cur.header.exposure_secs {
            info!(
                "observation {}: EXPOSURE_SECS changed from {} to {}",
                hdr.obs_id, cur.header.exposure_secs, hdr.exposure_secs
            );
        }

        // Roll before this sub-observation if it would push the file over
        // the limit.
        if self.file_size_limit > 0
            && cur.fits.bytes_written + hdr.subobs_plus_weights_bytes() > self.file_size_limit
        {
            info!(
                "observation {}: {} bytes written, rolling to file {:03}",
                hdr.obs_id,
                cur.fits.bytes_written,
                cur.file_number + 1
            );
            let next = match FitsWriter::create(
                &self.dest_dir,
                &hdr,
                cur.file_number + 1,
                cur.marker,
                hdr.unix_time,
                hdr.unix_time_msec,
                &self.hostname,
            ) {
                Ok(f) => f,
                Err(e) => {
                    self.finish_obs(cur);
                    return Err(e);
                }
            };
            cur.file_number += 1;
            let previous = std::mem::replace(&mut cur.fits, next);
            previous.close();
        }

        cur.obs_offset = hdr.obs_offset;
        cur.unix_time = hdr.unix_time;
        cur.unix_time_msec = hdr.unix_time_msec;
        cur.header = hdr;

        self.update_health_ids(
            cur.header.obs_id,
            cur.header.subobs_id,
            cur.header.ntiles() as usize,
        );
        self.state = ObsState::InObs(cur);
        Ok(Acceptance::Accept)
    }
}

impl RingClient for DbfitsClient {
    type Error = DbfitsError;

    fn on_open(&mut self, header: &[u8]) -> Result<Acceptance, DbfitsError> {
        let hdr = SubobsHeader::from_page(header)?;
        debug!(
            "open: obs {} subobs {} offset {} mode {:?}",
            hdr.obs_id, hdr.subobs_id, hdr.obs_offset, hdr.mode
        );

        match hdr.mode {
            Mode::Quit => {
                info!("MODE=QUIT received, shutting down");
                self.close_current();
                self.shutdown.trigger();
                return Ok(Acceptance::Quit);
            }
            // VCS and NO_CAPTURE windows are consumed without writes; the
            // observation state and any open file are left untouched.
            Mode::Vcs => {
                debug!("MODE=VCS, discarding sub-observation");
                return Ok(Acceptance::SkipBlockDuringVcs);
            }
            Mode::NoCapture => {
                debug!("MODE=NO_CAPTURE, discarding sub-observation");
                return Ok(Acceptance::SkipBlockDuringNoCapture);
            }
            Mode::Correlator => {}
        }

        if !hdr.populated {
            info!(
                "sub-observation {} of observation {} is not populated, discarding",
                hdr.subobs_id, hdr.obs_id
            );
            self.close_current();
            return Ok(Acceptance::SkipBlockDuringNoCapture);
        }

        match std::mem::take(&mut self.state) {
            ObsState::Idle => self.start_or_skip(hdr),
            ObsState::Skipping { obs_id } if obs_id == hdr.obs_id => {
                debug!("observation {obs_id} still in progress, skipping subobs {}", hdr.subobs_id);
                self.state = ObsState::Skipping { obs_id };
                Ok(Acceptance::Accept)
            }
            ObsState::Skipping { .. } => self.start_or_skip(hdr),
            ObsState::InObs(cur) if cur.header.obs_id == hdr.obs_id => self.continue_obs(cur, hdr),
            ObsState::InObs(cur) => {
                info!(
                    "new observation {} while {} was open, closing the old one",
                    hdr.obs_id, cur.header.obs_id
                );
                self.finish_obs(cur);
                self.start_or_skip(hdr)
            }
        }
    }

    fn on_block(&mut self, block: &[u8], block_id: u64) -> Result<u64, DbfitsError> {
        let ObsState::InObs(cur) = &mut self.state else {
            // skipped observation: consume the frame without writing
            return Ok(block.len() as u64);
        };

        let needed = cur.header.block_bytes();
        if (block.len() as u64) < needed {
            return Err(DbfitsError::BlockTooSmall {
                got: block.len() as u64,
                needed,
            });
        }

        let vis_bytes = cur.header.vis_bytes() as usize;
        let wts_bytes = cur.header.weights_bytes() as usize;
        let vis: Vec<f32> = bytemuck::pod_collect_to_vec(&block[..vis_bytes]);
        let wts: Vec<f32> = bytemuck::pod_collect_to_vec(&block[vis_bytes..vis_bytes + wts_bytes]);

        debug!(
            "block {block_id}: markers {}/{} at {}.{:03}",
            cur.marker,
            cur.marker + 1,
            cur.unix_time,
            cur.unix_time_msec
        );

        cur.fits.append_visibilities(
            &cur.header,
            cur.unix_time,
            cur.unix_time_msec,
            cur.marker,
            &vis,
        )?;
        cur.marker += 1;

        cur.fits.append_weights(
            &cur.header,
            cur.unix_time,
            cur.unix_time_msec,
            cur.marker,
            &wts,
        )?;
        cur.marker += 1;

        let advanced = cur.unix_time_msec + cur.header.int_time_msec;
        cur.unix_time += (advanced / 1000) as u64;
        cur.unix_time_msec = advanced % 1000;

        let ntiles = cur.header.ntiles() as usize;
        {
            let mut guard = self.health.lock().expect("health mutex poisoned");
            let h = &mut *guard;
            weights::accumulate_autos(&wts, ntiles, &mut h.weights_x, &mut h.weights_y);
            h.weights_counter += 1;
        }

        Ok(needed)
    }

    fn on_close(&mut self, total_bytes: u64) -> Result<(), DbfitsError> {
        let (duration, exposure, secs_per_subobs, obs_id) = {
            let ObsState::InObs(cur) = &self.state else {
                debug!("close: no observation open ({total_bytes} bytes consumed)");
                return Ok(());
            };
            let integrations = cur.marker / 2;
            (
                (integrations * i64::from(cur.header.int_time_msec) / 1000) as i32,
                cur.header.exposure_secs,
                cur.header.secs_per_subobs,
                cur.header.obs_id,
            )
        };

        // a sub-observation boundary must land on a whole number of
        // sub-observations worth of integrations
        if duration % secs_per_subobs != 0 {
            return Err(DbfitsError::SubobsIncomplete {
                duration,
                secs_per_subobs,
            });
        }

        debug!("close: observation {obs_id} at {duration}s of {exposure}s ({total_bytes} bytes)");

        if duration >= exposure {
            info!("observation {obs_id} complete after {duration}s");
            self.close_current();
        }
        Ok(())
    }
}
