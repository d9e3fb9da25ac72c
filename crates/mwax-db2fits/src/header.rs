//! Typed view of the ASCII header page that precedes every sub-observation,
//! plus the geometry derived from it and the invariant sweep that gates
//! every new observation.

use mwax_db2fits_common::ascii_header::AsciiHeader;

use crate::error::DbfitsError;

/// Correlator operating mode carried in the `MODE` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Correlator,
    Vcs,
    NoCapture,
    Quit,
}

impl Mode {
    fn parse(s: &str) -> Result<Self, DbfitsError> {
        match s {
            "CORRELATOR" => Ok(Mode::Correlator),
            "VCS" => Ok(Mode::Vcs),
            "NO_CAPTURE" => Ok(Mode::NoCapture),
            "QUIT" => Ok(Mode::Quit),
            _ => Err(DbfitsError::InvalidHeaderValue("MODE".into())),
        }
    }
}

/// `UTC_START` decomposed scanf-style from `YYYY-MM-DD-hh:mm:ss`.
/// No timezone math is done anywhere; the fields feed straight into the
/// output filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcStart {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl UtcStart {
    pub fn parse(s: &str) -> Result<Self, DbfitsError> {
        let bad = || DbfitsError::InvalidHeaderValue("UTC_START".into());

        let b = s.as_bytes();
        if b.len() != 19 || b[4] != b'-' || b[7] != b'-' || b[10] != b'-' || b[13] != b':' || b[16] != b':' {
            return Err(bad());
        }
        let field = |range: std::ops::Range<usize>| -> Result<u16, DbfitsError> {
            s[range].parse::<u16>().map_err(|_| bad())
        };

        let utc = Self {
            year: field(0..4)?,
            month: field(5..7)? as u8,
            day: field(8..10)? as u8,
            hour: field(11..13)? as u8,
            minute: field(14..16)? as u8,
            second: field(17..19)? as u8,
        };
        let plausible = (1..=12).contains(&utc.month)
            && (1..=31).contains(&utc.day)
            && utc.hour < 24
            && utc.minute < 60
            && utc.second < 60;
        if plausible { Ok(utc) } else { Err(bad()) }
    }

    /// `YYYYMMDDhhmmss`, as used in the output filename.
    #[must_use]
    pub fn compact(&self) -> String {
        format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Everything the writer needs out of one sub-observation header.
#[derive(Debug, Clone)]
pub struct SubobsHeader {
    pub populated: bool,
    pub obs_id: u64,
    pub subobs_id: u64,
    pub mode: Mode,
    pub utc_start: UtcStart,
    pub obs_offset: i32,
    pub nbit: i32,
    pub npol: i32,
    pub ninputs: i32,
    pub int_time_msec: i32,
    pub transfer_size: u64,
    pub proj_id: String,
    pub exposure_secs: i32,
    pub coarse_channel: i32,
    pub corr_coarse_channel: i32,
    pub secs_per_subobs: i32,
    pub unix_time: u64,
    pub unix_time_msec: i32,
    pub fine_chan_width_hz: i32,
    pub nfine_chan: i32,
    pub bandwidth_hz: i32,
    pub fscrunch_factor: i32,
    pub mc_ip: String,
    pub mc_port: i32,
    pub u2s_version: Option<String>,
    pub db2correlate2db_version: Option<String>,
}

impl SubobsHeader {
    pub fn from_page(page: &[u8]) -> Result<Self, DbfitsError> {
        let hdr = AsciiHeader::parse(page)?;

        let mode_str = hdr.get_str("MODE")?;
        if mode_str.len() > 32 {
            return Err(DbfitsError::InvalidHeaderValue("MODE".into()));
        }
        let proj_id: String = hdr.get_str("PROJ_ID")?.to_string();
        if proj_id.len() > 255 {
            return Err(DbfitsError::InvalidHeaderValue("PROJ_ID".into()));
        }

        let parsed = Self {
            populated: hdr.get::<i32>("POPULATED")? != 0,
            obs_id: hdr.get("OBS_ID")?,
            subobs_id: hdr.get("SUBOBS_ID")?,
            mode: Mode::parse(mode_str)?,
            utc_start: UtcStart::parse(hdr.get_str("UTC_START")?)?,
            obs_offset: hdr.get("OBS_OFFSET")?,
            nbit: hdr.get("NBIT")?,
            npol: hdr.get("NPOL")?,
            ninputs: hdr.get("NINPUTS")?,
            int_time_msec: hdr.get("INT_TIME_MSEC")?,
            transfer_size: hdr.get("TRANSFER_SIZE")?,
            proj_id,
            exposure_secs: hdr.get("EXPOSURE_SECS")?,
            coarse_channel: hdr.get("COARSE_CHANNEL")?,
            corr_coarse_channel: hdr.get("CORR_COARSE_CHANNEL")?,
            secs_per_subobs: hdr.get("SECS_PER_SUBOBS")?,
            unix_time: hdr.get("UNIXTIME")?,
            unix_time_msec: hdr.get("UNIXTIME_MSEC")?,
            fine_chan_width_hz: hdr.get("FINE_CHAN_WIDTH_HZ")?,
            nfine_chan: hdr.get("NFINE_CHAN")?,
            bandwidth_hz: hdr.get("BANDWIDTH_HZ")?,
            fscrunch_factor: hdr.get("FSCRUNCH_FACTOR")?,
            mc_ip: hdr.get_str("MC_IP")?.to_string(),
            mc_port: hdr.get("MC_PORT")?,
            u2s_version: hdr.get_opt_str("MWAX_U2S_VERSION").map(String::from),
            db2correlate2db_version: hdr
                .get_opt_str("MWAX_DB2CORRELATE2DB_VERSION")
                .map(String::from),
        };
        Ok(parsed)
    }

    // ---- derived geometry -------------------------------------------------

    #[must_use]
    pub fn ntiles(&self) -> i32 {
        self.ninputs / 2
    }

    /// Baseline count including autocorrelations.
    #[must_use]
    pub fn nbaselines(&self) -> i32 {
        self.ninputs * (self.ninputs + 2) / 8
    }

    #[must_use]
    pub fn npol_sq(&self) -> i32 {
        self.npol * self.npol
    }

    /// Floats per visibilities region: [baseline][fine_chan][pol_pair][r|i].
    #[must_use]
    pub fn vis_floats(&self) -> u64 {
        self.nbaselines() as u64 * self.nfine_chan as u64 * self.npol_sq() as u64 * 2
    }

    #[must_use]
    pub fn vis_bytes(&self) -> u64 {
        self.vis_floats() * 4
    }

    /// Floats per weights region: [baseline][pol_pair].
    #[must_use]
    pub fn weights_floats(&self) -> u64 {
        self.nbaselines() as u64 * self.npol_sq() as u64
    }

    #[must_use]
    pub fn weights_bytes(&self) -> u64 {
        self.weights_floats() * 4
    }

    /// Bytes per ring buffer block: one integration plus its weights.
    #[must_use]
    pub fn block_bytes(&self) -> u64 {
        self.vis_bytes() + self.weights_bytes()
    }

    #[must_use]
    pub fn integrations_per_subobs(&self) -> i32 {
        self.secs_per_subobs * 1000 / self.int_time_msec
    }

    #[must_use]
    pub fn subobs_plus_weights_bytes(&self) -> u64 {
        self.integrations_per_subobs() as u64 * self.block_bytes()
    }

    // ---- invariants -------------------------------------------------------

    /// The sanity sweep run against the first header of every observation
    /// (and re-run on every continuation header, which must agree).
    pub fn validate(&self) -> Result<(), DbfitsError> {
        fn fail(name: &'static str, value: impl ToString) -> Result<(), DbfitsError> {
            Err(DbfitsError::InvariantViolated {
                name,
                value: value.to_string(),
            })
        }

        if self.ninputs <= 0 || self.ninputs % 2 != 0 {
            return fail("NINPUTS", self.ninputs);
        }
        if !(0..=255).contains(&self.coarse_channel) {
            return fail("COARSE_CHANNEL", self.coarse_channel);
        }
        if self.corr_coarse_channel < 1 {
            return fail("CORR_COARSE_CHANNEL", self.corr_coarse_channel);
        }
        if self.bandwidth_hz <= 0 {
            return fail("BANDWIDTH_HZ", self.bandwidth_hz);
        }
        if self.fine_chan_width_hz < 1 || self.fine_chan_width_hz > self.bandwidth_hz {
            return fail("FINE_CHAN_WIDTH_HZ", self.fine_chan_width_hz);
        }
        if self.nfine_chan <= 0 || self.bandwidth_hz / self.nfine_chan != self.fine_chan_width_hz {
            return fail("NFINE_CHAN", self.nfine_chan);
        }
        if self.npol <= 0 {
            return fail("NPOL", self.npol);
        }
        if self.nbit < 8 || self.nbit % 8 != 0 {
            return fail("NBIT", self.nbit);
        }
        if self.secs_per_subobs <= 0 {
            return fail("SECS_PER_SUBOBS", self.secs_per_subobs);
        }
        if self.int_time_msec < 200 || self.int_time_msec > self.secs_per_subobs * 1000 {
            return fail("INT_TIME_MSEC", self.int_time_msec);
        }
        if self.secs_per_subobs * 1000 % self.int_time_msec != 0 {
            return fail("INT_TIME_MSEC", self.int_time_msec);
        }
        if self.exposure_secs < self.secs_per_subobs
            || self.exposure_secs % self.secs_per_subobs != 0
        {
            return fail("EXPOSURE_SECS", self.exposure_secs);
        }
        if !(0..1000).contains(&self.unix_time_msec) {
            return fail("UNIXTIME_MSEC", self.unix_time_msec);
        }
        if self.transfer_size < self.subobs_plus_weights_bytes() {
            return fail("TRANSFER_SIZE", self.transfer_size);
        }
        Ok(())
    }

    /// Fields that must not change between sub-observations of the same
    /// observation. `EXPOSURE_SECS` is deliberately absent: it may shrink.
    #[must_use]
    pub fn same_observation_shape(&self, other: &Self) -> bool {
        self.ninputs == other.ninputs
            && self.npol == other.npol
            && self.nbit == other.nbit
            && self.int_time_msec == other.int_time_msec
            && self.secs_per_subobs == other.secs_per_subobs
            && self.nfine_chan == other.nfine_chan
            && self.fine_chan_width_hz == other.fine_chan_width_hz
            && self.bandwidth_hz == other.bandwidth_hz
            && self.coarse_channel == other.coarse_channel
            && self.corr_coarse_channel == other.corr_coarse_channel
            && self.proj_id == other.proj_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwax_db2fits_common::ascii_header::render;

    fn header_pairs() -> Vec<(&'static str, String)> {
        vec![
            ("POPULATED", "1".into()),
            ("OBS_ID", "1000000000".into()),
            ("SUBOBS_ID", "1000000000".into()),
            ("MODE", "CORRELATOR".into()),
            ("UTC_START", "2023-01-02-03:04:05".into()),
            ("OBS_OFFSET", "0".into()),
            ("NBIT", "32".into()),
            ("NPOL", "2".into()),
            ("NINPUTS", "4".into()),
            ("INT_TIME_MSEC", "8000".into()),
            ("TRANSFER_SIZE", "240".into()),
            ("PROJ_ID", "T0001".into()),
            ("EXPOSURE_SECS", "8".into()),
            ("COARSE_CHANNEL", "1".into()),
            ("CORR_COARSE_CHANNEL", "1".into()),
            ("SECS_PER_SUBOBS", "8".into()),
            ("UNIXTIME", "1".into()),
            ("UNIXTIME_MSEC", "0".into()),
            ("FINE_CHAN_WIDTH_HZ", "1".into()),
            ("NFINE_CHAN", "2".into()),
            ("BANDWIDTH_HZ", "2".into()),
            ("FSCRUNCH_FACTOR", "1".into()),
            ("MC_IP", "239.0.0.1".into()),
            ("MC_PORT", "1234".into()),
        ]
    }

    fn page(overrides: &[(&str, &str)]) -> Vec<u8> {
        let mut pairs = header_pairs();
        for (k, v) in overrides {
            if let Some(p) = pairs.iter_mut().find(|(key, _)| key == k) {
                p.1 = (*v).to_string();
            } else {
                pairs.push((Box::leak(k.to_string().into_boxed_str()), (*v).to_string()));
            }
        }
        let borrowed: Vec<(&str, &str)> =
            pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        render(&borrowed).into_bytes()
    }

    #[test]
    fn parses_a_complete_header() {
        let h = SubobsHeader::from_page(&page(&[])).unwrap();
        assert_eq!(h.obs_id, 1_000_000_000);
        assert_eq!(h.mode, Mode::Correlator);
        assert_eq!(h.ntiles(), 2);
        assert_eq!(h.nbaselines(), 3);
        assert_eq!(h.vis_floats(), 3 * 2 * 4 * 2);
        assert_eq!(h.weights_floats(), 3 * 4);
        assert_eq!(h.integrations_per_subobs(), 1);
        assert_eq!(h.block_bytes(), 48 * 4 + 12 * 4);
        h.validate().unwrap();
    }

    #[test]
    fn missing_key_is_reported_by_name() {
        let mut pairs = header_pairs();
        pairs.retain(|(k, _)| *k != "NPOL");
        let borrowed: Vec<(&str, &str)> =
            pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let err = SubobsHeader::from_page(render(&borrowed).as_bytes()).unwrap_err();
        assert!(matches!(err, DbfitsError::MissingHeaderKey(k) if k == "NPOL"));
    }

    #[test]
    fn unknown_mode_fails() {
        let err = SubobsHeader::from_page(&page(&[("MODE", "BISTROMATH")])).unwrap_err();
        assert!(matches!(err, DbfitsError::InvalidHeaderValue(k) if k == "MODE"));
    }

    #[test]
    fn utc_start_decomposes() {
        let utc = UtcStart::parse("2023-01-02-03:04:05").unwrap();
        assert_eq!(utc.compact(), "20230102030405");
        assert!(UtcStart::parse("2023/01/02 03:04:05").is_err());
        assert!(UtcStart::parse("2023-13-02-03:04:05").is_err());
    }

    #[test]
    fn invariant_sweep_catches_bad_geometry() {
        let cases: &[(&str, &str, &str)] = &[
            ("NINPUTS", "3", "NINPUTS"),
            ("COARSE_CHANNEL", "300", "COARSE_CHANNEL"),
            ("CORR_COARSE_CHANNEL", "0", "CORR_COARSE_CHANNEL"),
            ("NBIT", "12", "NBIT"),
            ("INT_TIME_MSEC", "100", "INT_TIME_MSEC"),
            ("EXPOSURE_SECS", "12", "EXPOSURE_SECS"),
            ("UNIXTIME_MSEC", "1000", "UNIXTIME_MSEC"),
            ("TRANSFER_SIZE", "1", "TRANSFER_SIZE"),
        ];
        for (key, value, expect) in cases {
            let h = SubobsHeader::from_page(&page(&[(key, value)])).unwrap();
            let err = h.validate().unwrap_err();
            match err {
                DbfitsError::InvariantViolated { name, .. } => assert_eq!(&name, expect),
                other => panic!("expected InvariantViolated for {key}, got {other}"),
            }
        }
    }

    #[test]
    fn exposure_change_does_not_break_shape_equality() {
        let a = SubobsHeader::from_page(&page(&[("EXPOSURE_SECS", "16")])).unwrap();
        let b = SubobsHeader::from_page(&page(&[("EXPOSURE_SECS", "8")])).unwrap();
        assert!(a.same_observation_shape(&b));
        let c = SubobsHeader::from_page(&page(&[("NINPUTS", "8")])).unwrap();
        assert!(!a.same_observation_shape(&c));
    }
}
