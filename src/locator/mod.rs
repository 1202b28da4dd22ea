//! Hypocenter location (C9).
//!
//! Arrival-time inversion in two stages: a coarse grid search fixes the
//! starting point (origin time by median observed-minus-predicted),
//! then Gauss-Newton weighted least squares refines `(lat, lon, depth,
//! t0)` against the bundled 1-D travel-time model. The error ellipse
//! comes from the covariance of the final normal equations projected to
//! the horizontal plane.

mod travel_time;

pub use travel_time::{Layer, TravelTimeModel};

use nalgebra::{DMatrix, DVector, Matrix2, SymmetricEigen};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::config::LocatorSettings;
use crate::error::PipelineError;
use crate::types::{LocationEstimate, NANOS_PER_SEC};

/// Kilometers per degree of latitude.
const KM_PER_DEG_LAT: f64 = 110.57;
/// Kilometers per degree of longitude at the equator.
const KM_PER_DEG_LON_EQ: f64 = 111.32;

/// Locator failures. The pipeline dead-letters these rather than
/// dropping the event.
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("insufficient stations: need {needed}, have {got}")]
    InsufficientStations { needed: usize, got: usize },

    #[error("unknown station '{0}'")]
    UnknownStation(String),

    #[error("normal equations are singular")]
    Singular,
}

impl From<LocatorError> for PipelineError {
    fn from(err: LocatorError) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

// ============================================================================
// Station registry
// ============================================================================

/// One station's coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub code: String,
    pub network: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation_m: f64,
}

#[derive(Debug, Deserialize)]
struct StationFile {
    stations: Vec<Station>,
}

/// Station code → coordinates, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StationRegistry {
    by_code: HashMap<String, Station>,
}

impl StationRegistry {
    pub fn from_stations(stations: Vec<Station>) -> Self {
        Self {
            by_code: stations.into_iter().map(|s| (s.code.clone(), s)).collect(),
        }
    }

    /// Load the TOML registry (`[[stations]]` entries).
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Validation(format!("cannot read stations {}: {e}", path.display()))
        })?;
        let parsed: StationFile = toml::from_str(&raw).map_err(|e| {
            PipelineError::Validation(format!("cannot parse stations {}: {e}", path.display()))
        })?;
        tracing::info!(count = parsed.stations.len(), path = %path.display(), "station registry loaded");
        Ok(Self::from_stations(parsed.stations))
    }

    pub fn get(&self, code: &str) -> Option<&Station> {
        self.by_code.get(code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.by_code.values()
    }
}

// ============================================================================
// Picks and the locator
// ============================================================================

/// One station's P arrival pick.
#[derive(Debug, Clone)]
pub struct ArrivalPick {
    pub station: String,
    /// Arrival instant, UTC nanoseconds.
    pub time_ns: i64,
    /// Pick uncertainty in seconds; weights are `1/sigma^2`.
    pub sigma_s: f64,
}

/// Internal working form of a pick with resolved coordinates.
struct ResolvedPick {
    lat: f64,
    lon: f64,
    /// Arrival seconds relative to the earliest pick.
    t_obs_s: f64,
    weight: f64,
}

/// Hypocenter solver.
pub struct Locator {
    settings: LocatorSettings,
    registry: StationRegistry,
    model: TravelTimeModel,
}

impl Locator {
    pub fn new(settings: LocatorSettings, registry: StationRegistry, model: TravelTimeModel) -> Self {
        Self {
            settings,
            registry,
            model,
        }
    }

    pub fn registry(&self) -> &StationRegistry {
        &self.registry
    }

    /// Locate from arrival picks.
    ///
    /// Also returns the estimated origin time in nanoseconds.
    pub fn locate(&self, picks: &[ArrivalPick]) -> Result<(LocationEstimate, i64), LocatorError> {
        if picks.len() < self.settings.min_stations {
            return Err(LocatorError::InsufficientStations {
                needed: self.settings.min_stations,
                got: picks.len(),
            });
        }

        let t_ref_ns = picks.iter().map(|p| p.time_ns).min().unwrap_or(0);
        let resolved: Vec<ResolvedPick> = picks
            .iter()
            .map(|p| {
                let station = self
                    .registry
                    .get(&p.station)
                    .ok_or_else(|| LocatorError::UnknownStation(p.station.clone()))?;
                let sigma = p.sigma_s.max(1e-3);
                Ok(ResolvedPick {
                    lat: station.latitude,
                    lon: station.longitude,
                    t_obs_s: (p.time_ns - t_ref_ns) as f64 / NANOS_PER_SEC as f64,
                    weight: 1.0 / (sigma * sigma),
                })
            })
            .collect::<Result<_, LocatorError>>()?;

        let start = self.grid_search(&resolved);
        let (estimate, t0_s) = self.refine(&resolved, start)?;
        let origin_ns = t_ref_ns + (t0_s * NANOS_PER_SEC as f64) as i64;
        Ok((estimate, origin_ns))
    }

    /// Predicted travel time from a trial hypocenter to a pick's station.
    fn predict(&self, lat: f64, lon: f64, depth: f64, pick: &ResolvedPick) -> f64 {
        let distance = horizontal_km(lat, lon, pick.lat, pick.lon);
        self.model.travel_time(distance, depth)
    }

    /// Weighted misfit with the origin time profiled out by the median.
    fn misfit(&self, lat: f64, lon: f64, depth: f64, picks: &[ResolvedPick]) -> (f64, f64) {
        let mut offsets: Vec<f64> = picks
            .iter()
            .map(|p| p.t_obs_s - self.predict(lat, lon, depth, p))
            .collect();
        offsets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let t0 = offsets[offsets.len() / 2];

        let ss: f64 = picks
            .iter()
            .map(|p| {
                let r = p.t_obs_s - t0 - self.predict(lat, lon, depth, p);
                p.weight * r * r
            })
            .sum();
        (ss, t0)
    }

    /// Coarse lattice over the station footprint plus a depth ladder.
    fn grid_search(&self, picks: &[ResolvedPick]) -> (f64, f64, f64, f64) {
        let lat_min = picks.iter().map(|p| p.lat).fold(f64::INFINITY, f64::min) - 1.0;
        let lat_max = picks.iter().map(|p| p.lat).fold(f64::NEG_INFINITY, f64::max) + 1.0;
        let lon_min = picks.iter().map(|p| p.lon).fold(f64::INFINITY, f64::min) - 1.0;
        let lon_max = picks.iter().map(|p| p.lon).fold(f64::NEG_INFINITY, f64::max) + 1.0;

        let step = self.settings.grid_step_deg;
        let depths = [0.0, 5.0, 10.0, 20.0, 40.0, 80.0];

        let lat_steps = ((lat_max - lat_min) / step).ceil() as usize + 1;
        let lon_steps = ((lon_max - lon_min) / step).ceil() as usize + 1;

        let candidates: Vec<(f64, f64, f64)> = (0..lat_steps)
            .flat_map(move |i| {
                let lat = lat_min + i as f64 * step;
                (0..lon_steps).flat_map(move |j| {
                    let lon = lon_min + j as f64 * step;
                    let depths = depths;
                    depths.into_iter().map(move |d| (lat, lon, d))
                })
            })
            .collect();

        let best = candidates
            .par_iter()
            .map(|&(lat, lon, depth)| {
                let (ss, t0) = self.misfit(lat, lon, depth, picks);
                (ss, lat, lon, depth, t0)
            })
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .expect("grid has at least one candidate");

        (best.1, best.2, best.3, best.4)
    }

    /// Gauss-Newton refinement of `(lat, lon, depth, t0)`.
    fn refine(
        &self,
        picks: &[ResolvedPick],
        start: (f64, f64, f64, f64),
    ) -> Result<(LocationEstimate, f64), LocatorError> {
        let n = picks.len();
        let (mut lat, mut lon, mut depth, mut t0) = start;

        let d_lat = 1e-3;
        let d_lon = 1e-3;
        let d_depth = 0.1;

        let mut jacobian = DMatrix::<f64>::zeros(n, 4);
        let mut residuals = DVector::<f64>::zeros(n);
        let weights = DVector::<f64>::from_iterator(n, picks.iter().map(|p| p.weight));

        for _ in 0..self.settings.max_iter {
            for (i, pick) in picks.iter().enumerate() {
                let t = self.predict(lat, lon, depth, pick);
                residuals[i] = pick.t_obs_s - t0 - t;

                let dt_dlat =
                    (self.predict(lat + d_lat, lon, depth, pick) - t) / d_lat;
                let dt_dlon =
                    (self.predict(lat, lon + d_lon, depth, pick) - t) / d_lon;
                let dt_ddepth =
                    (self.predict(lat, lon, depth + d_depth, pick) - t) / d_depth;

                jacobian[(i, 0)] = dt_dlat;
                jacobian[(i, 1)] = dt_dlon;
                jacobian[(i, 2)] = dt_ddepth;
                jacobian[(i, 3)] = 1.0;
            }

            let wj = DMatrix::from_fn(n, 4, |i, j| jacobian[(i, j)] * weights[i]);
            let normal = jacobian.transpose() * &wj;
            let rhs = wj.transpose() * &residuals;

            let delta = normal
                .clone()
                .lu()
                .solve(&rhs)
                .ok_or(LocatorError::Singular)?;
            if delta.iter().any(|v| !v.is_finite()) {
                return Err(LocatorError::Singular);
            }

            lat = (lat + delta[0]).clamp(-90.0, 90.0);
            lon = (lon + delta[1]).clamp(-180.0, 180.0);
            depth = (depth + delta[2]).clamp(0.0, 700.0);
            t0 += delta[3];

            let step_km = (delta[0] * KM_PER_DEG_LAT).hypot(
                delta[1] * KM_PER_DEG_LON_EQ * lat.to_radians().cos(),
            );
            if step_km.hypot(delta[2]) < self.settings.eps_km {
                break;
            }
        }

        // Final residuals and covariance at the solution.
        let mut ss_w = 0.0;
        let mut ss = 0.0;
        for (i, pick) in picks.iter().enumerate() {
            let t = self.predict(lat, lon, depth, pick);
            let r = pick.t_obs_s - t0 - t;
            residuals[i] = r;
            ss_w += pick.weight * r * r;
            ss += r * r;

            let dt_dlat = (self.predict(lat + d_lat, lon, depth, pick) - t) / d_lat;
            let dt_dlon = (self.predict(lat, lon + d_lon, depth, pick) - t) / d_lon;
            let dt_ddepth = (self.predict(lat, lon, depth + d_depth, pick) - t) / d_depth;
            jacobian[(i, 0)] = dt_dlat;
            jacobian[(i, 1)] = dt_dlon;
            jacobian[(i, 2)] = dt_ddepth;
            jacobian[(i, 3)] = 1.0;
        }
        let rms_residual_s = (ss / n as f64).sqrt();

        let wj = DMatrix::from_fn(n, 4, |i, j| jacobian[(i, j)] * weights[i]);
        let normal = jacobian.transpose() * &wj;
        let dof = (n as f64 - 4.0).max(1.0);
        let sigma2 = ss_w / dof;
        let covariance = normal
            .try_inverse()
            .ok_or(LocatorError::Singular)?
            * sigma2;

        // Horizontal block in km^2.
        let lat_to_km = KM_PER_DEG_LAT;
        let lon_to_km = KM_PER_DEG_LON_EQ * lat.to_radians().cos();
        let h = Matrix2::new(
            covariance[(0, 0)] * lat_to_km * lat_to_km,
            covariance[(0, 1)] * lat_to_km * lon_to_km,
            covariance[(1, 0)] * lat_to_km * lon_to_km,
            covariance[(1, 1)] * lon_to_km * lon_to_km,
        );
        let eigen = SymmetricEigen::new(h);
        // Floor at 1e-12 km^2: rounding can push a semidefinite block
        // fractionally negative, and the ellipse area must stay finite
        // and positive.
        let (e0, e1) = (
            eigen.eigenvalues[0].max(1e-12),
            eigen.eigenvalues[1].max(1e-12),
        );
        let (major_idx, major, minor) = if e0 >= e1 { (0, e0, e1) } else { (1, e1, e0) };
        let axis = eigen.eigenvectors.column(major_idx);
        // Column 0 component is north (lat), column 1 east (lon).
        let azimuth_deg = axis[1].atan2(axis[0]).to_degrees().rem_euclid(360.0);

        let estimate = LocationEstimate {
            latitude: lat,
            longitude: lon,
            depth_km: depth,
            horizontal_err_km: major.sqrt(),
            depth_err_km: covariance[(2, 2)].max(0.0).sqrt(),
            rms_residual_s,
            ellipse_major_km: major.sqrt(),
            ellipse_minor_km: minor.sqrt(),
            ellipse_azimuth_deg: azimuth_deg,
        };
        let finite = [
            estimate.latitude,
            estimate.longitude,
            estimate.depth_km,
            estimate.horizontal_err_km,
            estimate.depth_err_km,
            estimate.rms_residual_s,
            estimate.ellipse_azimuth_deg,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite || !t0.is_finite() {
            return Err(LocatorError::Singular);
        }
        Ok((estimate, t0))
    }
}

/// Equirectangular horizontal distance in km.
fn horizontal_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dx = (lon2 - lon1) * KM_PER_DEG_LON_EQ * mean_lat.cos();
    let dy = (lat2 - lat1) * KM_PER_DEG_LAT;
    dx.hypot(dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn registry() -> StationRegistry {
        StationRegistry::from_stations(vec![
            station("STA1", 35.3, -118.4),
            station("STA2", 34.7, -117.6),
            station("STA3", 35.4, -117.5),
            station("STA4", 34.6, -118.5),
            station("STA5", 35.0, -117.2),
        ])
    }

    fn station(code: &str, lat: f64, lon: f64) -> Station {
        Station {
            code: code.into(),
            network: "QW".into(),
            latitude: lat,
            longitude: lon,
            elevation_m: 0.0,
        }
    }

    fn locator() -> Locator {
        Locator::new(
            LocatorSettings::default(),
            registry(),
            TravelTimeModel::default_crust(),
        )
    }

    /// Synthetic picks from a known source, with optional timing noise.
    fn synthetic_picks(
        loc: &Locator,
        lat: f64,
        lon: f64,
        depth: f64,
        t0_ns: i64,
        noise_s: f64,
        stations: &[&str],
    ) -> Vec<ArrivalPick> {
        let mut rng = StdRng::seed_from_u64(42);
        let normal = Normal::new(0.0, noise_s.max(1e-12)).unwrap();
        stations
            .iter()
            .map(|code| {
                let st = loc.registry().get(code).unwrap();
                let dist = horizontal_km(lat, lon, st.latitude, st.longitude);
                let tt = loc.model.travel_time(dist, depth);
                let noise = if noise_s > 0.0 { normal.sample(&mut rng) } else { 0.0 };
                ArrivalPick {
                    station: (*code).to_string(),
                    time_ns: t0_ns + ((tt + noise) * NANOS_PER_SEC as f64) as i64,
                    sigma_s: 0.05,
                }
            })
            .collect()
    }

    #[test]
    fn four_station_location_recovers_source() {
        let loc = locator();
        let t0 = 1_700_000_000_000_000_000_i64;
        let picks = synthetic_picks(
            &loc,
            35.0,
            -118.0,
            10.0,
            t0,
            0.05,
            &["STA1", "STA2", "STA3", "STA4"],
        );

        let (estimate, origin_ns) = loc.locate(&picks).unwrap();

        let horiz_km = horizontal_km(estimate.latitude, estimate.longitude, 35.0, -118.0);
        assert!(horiz_km < 5.0, "horizontal miss {horiz_km} km");
        assert!((estimate.depth_km - 10.0).abs() < 8.0, "depth {}", estimate.depth_km);
        assert!(estimate.rms_residual_s < 0.1, "rms {}", estimate.rms_residual_s);
        assert!(
            estimate.ellipse_major_km > 0.0 && estimate.ellipse_minor_km > 0.0,
            "ellipse must have finite positive area"
        );
        let origin_err_s = (origin_ns - t0).abs() as f64 / 1e9;
        assert!(origin_err_s < 1.0, "origin time off by {origin_err_s} s");
    }

    #[test]
    fn noise_free_picks_locate_exactly() {
        let loc = locator();
        let picks = synthetic_picks(
            &loc,
            35.1,
            -117.9,
            15.0,
            0,
            0.0,
            &["STA1", "STA2", "STA3", "STA4", "STA5"],
        );
        let (estimate, _) = loc.locate(&picks).unwrap();
        let horiz_km = horizontal_km(estimate.latitude, estimate.longitude, 35.1, -117.9);
        assert!(horiz_km < 1.0, "horizontal miss {horiz_km} km");
        assert!(estimate.rms_residual_s < 0.01);
    }

    #[test]
    fn below_min_stations_is_rejected() {
        let loc = locator();
        let picks = synthetic_picks(&loc, 35.0, -118.0, 10.0, 0, 0.0, &["STA1", "STA2", "STA3"]);
        match loc.locate(&picks) {
            Err(LocatorError::InsufficientStations { needed, got }) => {
                assert_eq!(needed, 4);
                assert_eq!(got, 3);
            }
            other => panic!("expected InsufficientStations, got {other:?}"),
        }
    }

    #[test]
    fn unknown_station_is_rejected() {
        let loc = locator();
        let mut picks =
            synthetic_picks(&loc, 35.0, -118.0, 10.0, 0, 0.0, &["STA1", "STA2", "STA3"]);
        picks.push(ArrivalPick {
            station: "NOPE".into(),
            time_ns: 0,
            sigma_s: 0.05,
        });
        assert!(matches!(
            loc.locate(&picks),
            Err(LocatorError::UnknownStation(_))
        ));
    }

    #[test]
    fn registry_loads_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.toml");
        std::fs::write(
            &path,
            r#"
            [[stations]]
            code = "STA1"
            network = "QW"
            latitude = 35.3
            longitude = -118.4
            elevation_m = 120.0

            [[stations]]
            code = "STA2"
            network = "QW"
            latitude = 34.7
            longitude = -117.6
            "#,
        )
        .unwrap();

        let registry = StationRegistry::from_file(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert!((registry.get("STA1").unwrap().elevation_m - 120.0).abs() < 1e-9);
        assert_eq!(registry.get("STA2").unwrap().elevation_m, 0.0);
    }
}
