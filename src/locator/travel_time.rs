//! 1-D travel-time model.
//!
//! Piecewise-constant P velocity over depth. Travel time is slant
//! distance divided by the depth-averaged velocity along the vertical
//! leg of the path — smooth in distance, piecewise-smooth in depth,
//! which keeps the inversion Jacobian well behaved. The model is an
//! opaque resource bundled with the locator; there is no on-disk
//! format.

/// One constant-velocity layer starting at `top_km`.
#[derive(Debug, Clone, Copy)]
pub struct Layer {
    pub top_km: f64,
    pub vp_km_s: f64,
}

/// Piecewise-constant 1-D velocity profile.
#[derive(Debug, Clone)]
pub struct TravelTimeModel {
    layers: Vec<Layer>,
}

impl TravelTimeModel {
    /// Generic continental crust profile.
    pub fn default_crust() -> Self {
        Self {
            layers: vec![
                Layer { top_km: 0.0, vp_km_s: 5.8 },
                Layer { top_km: 20.0, vp_km_s: 6.5 },
                Layer { top_km: 35.0, vp_km_s: 8.0 },
            ],
        }
    }

    /// Build from explicit layers; panics in debug builds if layers are
    /// not sorted by depth.
    pub fn new(layers: Vec<Layer>) -> Self {
        debug_assert!(layers.windows(2).all(|w| w[0].top_km < w[1].top_km));
        Self { layers }
    }

    /// Velocity at a depth.
    pub fn velocity_at(&self, depth_km: f64) -> f64 {
        let mut v = self.layers.first().map(|l| l.vp_km_s).unwrap_or(5.8);
        for layer in &self.layers {
            if depth_km >= layer.top_km {
                v = layer.vp_km_s;
            }
        }
        v
    }

    /// Average slowness-weighted velocity from the surface to `depth_km`.
    fn path_velocity(&self, depth_km: f64) -> f64 {
        if depth_km <= 0.0 {
            return self.velocity_at(0.0);
        }
        // Vertical travel time through the stack above the source.
        let mut t = 0.0;
        let mut covered = 0.0;
        for (i, layer) in self.layers.iter().enumerate() {
            let bottom = self
                .layers
                .get(i + 1)
                .map(|l| l.top_km)
                .unwrap_or(f64::INFINITY);
            if layer.top_km >= depth_km {
                break;
            }
            let thickness = (bottom.min(depth_km) - layer.top_km).max(0.0);
            t += thickness / layer.vp_km_s;
            covered += thickness;
        }
        if covered <= 0.0 || t <= 0.0 {
            self.velocity_at(0.0)
        } else {
            covered / t
        }
    }

    /// P travel time in seconds from a source at `depth_km` to a surface
    /// station at epicentral distance `distance_km`.
    pub fn travel_time(&self, distance_km: f64, depth_km: f64) -> f64 {
        let slant = (distance_km * distance_km + depth_km * depth_km).sqrt();
        slant / self.path_velocity(depth_km)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_increases_with_depth() {
        let model = TravelTimeModel::default_crust();
        assert!(model.velocity_at(5.0) < model.velocity_at(25.0));
        assert!(model.velocity_at(25.0) < model.velocity_at(50.0));
    }

    #[test]
    fn travel_time_grows_with_distance() {
        let model = TravelTimeModel::default_crust();
        let t10 = model.travel_time(10.0, 10.0);
        let t50 = model.travel_time(50.0, 10.0);
        assert!(t50 > t10);
    }

    #[test]
    fn shallow_source_matches_surface_velocity() {
        let model = TravelTimeModel::default_crust();
        let t = model.travel_time(58.0, 0.0);
        assert!((t - 10.0).abs() < 1e-9, "t = {t}");
    }

    #[test]
    fn path_velocity_blends_layers() {
        let model = TravelTimeModel::default_crust();
        // 30 km source: 20 km at 5.8 plus 10 km at 6.5.
        let expected = 30.0 / (20.0 / 5.8 + 10.0 / 6.5);
        let slant = 30.0; // straight down
        let t = model.travel_time(0.0, 30.0);
        assert!((t - slant / expected).abs() < 1e-9);
    }
}
