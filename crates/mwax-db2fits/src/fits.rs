//! Output file handling: primary HDU metadata, visibility / weights image
//! extensions, and the `.tmp` → `.fits` rename that publishes a file to the
//! archiver.

use std::path::{Path, PathBuf};

use fitsio::{errors::check_status as fits_check_status, FitsFile};
use tracing::{info, warn};

use crate::{error::DbfitsError, header::SubobsHeader};

/// cfitsio BITPIX code for 32 bit float images.
const FLOAT_IMG: libc::c_int = -32;

/// Version stamped into the primary HDU as `CORR_VER`.
const CORRELATOR_VERSION: i32 = 2;

pub struct FitsWriter {
    fits: FitsFile,
    tmp_path: PathBuf,
    final_path: PathBuf,
    /// Index of the next HDU to be created (0 is the primary HDU).
    next_hdu: usize,
    /// Bytes of image data appended so far; drives the file roll decision.
    pub bytes_written: u64,
}

impl FitsWriter {
    /// Absolute path of the finished file (without the `.tmp` suffix).
    #[must_use]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Create `<dest>/<obs_id>_<YYYYMMDDhhmmss>_ch<CCC>_<FFF>.fits.tmp` and
    /// populate its primary HDU.
    pub fn create(
        dest_dir: &Path,
        header: &SubobsHeader,
        file_number: u32,
        marker: i64,
        unix_time: u64,
        unix_time_msec: i32,
        hostname: &str,
    ) -> Result<Self, DbfitsError> {
        let stem = format!(
            "{}_{}_ch{:03}_{:03}.fits",
            header.obs_id,
            header.utc_start.compact(),
            header.coarse_channel,
            file_number
        );
        let final_path = dest_dir.join(&stem);
        let tmp_path = dest_dir.join(format!("{stem}.tmp"));

        info!("creating new fits file {}", tmp_path.display());

        let mut fits = FitsFile::create(&tmp_path).overwrite().open()?;
        let hdu = fits.primary_hdu()?;

        hdu.write_key(&mut fits, "CORR_VER", CORRELATOR_VERSION)?;
        hdu.write_key(
            &mut fits,
            "U2S_VER",
            header.u2s_version.clone().unwrap_or_else(|| "Unknown".to_string()),
        )?;
        hdu.write_key(
            &mut fits,
            "CBF_VER",
            header
                .db2correlate2db_version
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        )?;
        hdu.write_key(&mut fits, "DB2F_VER", env!("CARGO_PKG_VERSION").to_string())?;
        hdu.write_key(&mut fits, "MARKER", marker)?;
        hdu.write_key(&mut fits, "TIME", unix_time as i64)?;
        hdu.write_key(&mut fits, "MILLITIM", unix_time_msec)?;
        hdu.write_key(&mut fits, "PROJID", header.proj_id.clone())?;
        hdu.write_key(&mut fits, "OBSID", header.obs_id as i64)?;
        hdu.write_key(&mut fits, "FINECHAN", header.fine_chan_width_hz as f32 / 1000.0)?;
        hdu.write_key(&mut fits, "NFINECHS", header.nfine_chan)?;
        hdu.write_key(&mut fits, "INTTIME", header.int_time_msec as f32 / 1000.0)?;
        hdu.write_key(&mut fits, "NINPUTS", header.ninputs)?;
        hdu.write_key(&mut fits, "CORRHOST", hostname.to_string())?;
        hdu.write_key(&mut fits, "CORRCHAN", header.corr_coarse_channel - 1)?;
        hdu.write_key(&mut fits, "MC_IP", header.mc_ip.clone())?;
        hdu.write_key(&mut fits, "MC_PORT", header.mc_port)?;

        Ok(Self {
            fits,
            tmp_path,
            final_path,
            next_hdu: 1,
            bytes_written: 0,
        })
    }

    /// Append the visibilities of one integration:
    /// NAXIS1 = nfine_chan·npol²·2, NAXIS2 = nbaselines.
    pub fn append_visibilities(
        &mut self,
        header: &SubobsHeader,
        unix_time: u64,
        unix_time_msec: i32,
        marker: i64,
        data: &[f32],
    ) -> Result<(), DbfitsError> {
        let naxis1 = header.nfine_chan as u64 * header.npol_sq() as u64 * 2;
        let naxis2 = header.nbaselines() as u64;
        self.append_float_image(naxis1, naxis2, unix_time, unix_time_msec, marker, data)
    }

    /// Append the weights of one integration:
    /// NAXIS1 = npol², NAXIS2 = nbaselines.
    pub fn append_weights(
        &mut self,
        header: &SubobsHeader,
        unix_time: u64,
        unix_time_msec: i32,
        marker: i64,
        data: &[f32],
    ) -> Result<(), DbfitsError> {
        let naxis1 = header.npol_sq() as u64;
        let naxis2 = header.nbaselines() as u64;
        self.append_float_image(naxis1, naxis2, unix_time, unix_time_msec, marker, data)
    }

    fn append_float_image(
        &mut self,
        naxis1: u64,
        naxis2: u64,
        unix_time: u64,
        unix_time_msec: i32,
        marker: i64,
        data: &[f32],
    ) -> Result<(), DbfitsError> {
        let expected = naxis1 * naxis2 * 4;
        let wrote = data.len() as u64 * 4;
        if wrote != expected {
            return Err(DbfitsError::HduSizeMismatch { wrote, expected });
        }

        // The high level API insists on an EXTNAME per image; these HDUs are
        // anonymous, so create them through cfitsio directly.
        let mut status = 0;
        let mut naxes: [libc::c_long; 2] = [naxis1 as libc::c_long, naxis2 as libc::c_long];
        unsafe {
            fitsio_sys::ffcrim(
                self.fits.as_raw(), /* I - FITS file pointer        */
                FLOAT_IMG,          /* I - bits per image pixel     */
                2,                  /* I - number of axes           */
                naxes.as_mut_ptr(), /* I - size of each axis        */
                &mut status,        /* IO - error status            */
            );
        }
        fits_check_status(status)?;

        unsafe {
            fitsio_sys::ffppre(
                self.fits.as_raw(),            /* I - FITS file pointer      */
                1,                             /* I - group to write         */
                1,                             /* I - first element to write */
                data.len() as libc::c_long,    /* I - number of elements     */
                data.as_ptr().cast_mut(),      /* I - array of values        */
                &mut status,                   /* IO - error status          */
            );
        }
        fits_check_status(status)?;

        let hdu = self.fits.hdu(self.next_hdu)?;
        hdu.write_key(&mut self.fits, "TIME", unix_time as i64)?;
        hdu.write_key(&mut self.fits, "MILLITIM", unix_time_msec)?;
        hdu.write_key(&mut self.fits, "MARKER", marker)?;

        self.next_hdu += 1;
        self.bytes_written += wrote;
        Ok(())
    }

    /// Flush and close the file, then publish it by dropping the `.tmp`
    /// suffix. A failed rename leaves the data on disk and is not fatal.
    pub fn close(self) {
        let FitsWriter {
            fits,
            tmp_path,
            final_path,
            bytes_written,
            ..
        } = self;
        drop(fits);

        match std::fs::rename(&tmp_path, &final_path) {
            Ok(()) => info!(
                "closed {} ({bytes_written} bytes of image data)",
                final_path.display()
            ),
            Err(e) => warn!(
                "could not rename {} to {}: {e}",
                tmp_path.display(),
                final_path.display()
            ),
        }
    }
}
