//! Cartesian ↔ mechanical coordinate transforms.
//!
//! Mechanical positions are integer step counts, one per motor: (X,Y,Z,E)
//! for a cartesian machine, (A,B,C,E) carriage heights for a linear delta.
//! Host coordinates pass through the bed-leveling rotation before inverse
//! kinematics; the reverse path applies the transpose.

use cinder_shared::config::{BedLevelConfig, Config, MachineKind};

pub const AXIS_COUNT: usize = 4;
pub const AXIS_E: usize = 3;

/// Bed-leveling rotation held as integer numerators over one shared
/// denominator. Repeated application cannot accumulate drift.
#[derive(Debug, Clone)]
pub struct BedLevel {
    num: [[i64; 3]; 3],
    den: f64,
}

impl BedLevel {
    pub fn identity() -> Self {
        BedLevel {
            num: [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
            den: 1.0,
        }
    }

    pub fn from_config(config: &BedLevelConfig) -> Self {
        BedLevel {
            num: config.numerators,
            den: config.denominator as f64,
        }
    }

    /// Host → physical frame.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let n = &self.num;
        [
            (n[0][0] as f64 * p[0] + n[0][1] as f64 * p[1] + n[0][2] as f64 * p[2]) / self.den,
            (n[1][0] as f64 * p[0] + n[1][1] as f64 * p[1] + n[1][2] as f64 * p[2]) / self.den,
            (n[2][0] as f64 * p[0] + n[2][1] as f64 * p[1] + n[2][2] as f64 * p[2]) / self.den,
        ]
    }

    /// Physical → host frame. The leveling matrix is a small rotation, so
    /// the transpose is its inverse.
    pub fn unapply(&self, p: [f64; 3]) -> [f64; 3] {
        let n = &self.num;
        [
            (n[0][0] as f64 * p[0] + n[1][0] as f64 * p[1] + n[2][0] as f64 * p[2]) / self.den,
            (n[0][1] as f64 * p[0] + n[1][1] as f64 * p[1] + n[2][1] as f64 * p[2]) / self.den,
            (n[0][2] as f64 * p[0] + n[1][2] as f64 * p[1] + n[2][2] as f64 * p[2]) / self.den,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct CartesianMap {
    steps_per_mm: f64,
    steps_per_mm_e: f64,
    level: BedLevel,
}

#[derive(Debug, Clone)]
pub struct DeltaMap {
    rod_length: f64,
    column_height: f64,
    build_radius: f64,
    steps_per_mm: f64,
    steps_per_mm_e: f64,
    /// Tower base coordinates in the horizontal plane, A/B/C order.
    towers: [[f64; 2]; 3],
    level: BedLevel,
}

/// The machine's coordinate transform, fixed at startup.
#[derive(Debug, Clone)]
pub enum CoordMap {
    Cartesian(CartesianMap),
    Delta(DeltaMap),
}

impl CoordMap {
    pub fn from_config(config: &Config) -> Self {
        let level = config
            .geometry
            .bed_level
            .as_ref()
            .map(BedLevel::from_config)
            .unwrap_or_else(BedLevel::identity);
        let steps_per_mm = config.geometry.steps_per_m / 1000.0;
        let steps_per_mm_e = config.geometry.steps_per_m_e / 1000.0;
        match config.printer.kinematics {
            MachineKind::Cartesian => CoordMap::Cartesian(CartesianMap {
                steps_per_mm,
                steps_per_mm_e,
                level,
            }),
            MachineKind::Delta => {
                let r = config.geometry.delta_radius;
                // A/B/C towers at 210°, 330°, 90°
                let towers = [210.0_f64, 330.0, 90.0].map(|deg: f64| {
                    let rad = deg.to_radians();
                    [r * rad.cos(), r * rad.sin()]
                });
                CoordMap::Delta(DeltaMap {
                    rod_length: config.geometry.rod_length,
                    column_height: config.geometry.column_height,
                    build_radius: config.geometry.build_radius,
                    steps_per_mm,
                    steps_per_mm_e,
                    towers,
                    level,
                })
            }
        }
    }

    pub fn kind(&self) -> MachineKind {
        match self {
            CoordMap::Cartesian(_) => MachineKind::Cartesian,
            CoordMap::Delta(_) => MachineKind::Delta,
        }
    }

    pub fn steps_per_mm(&self, axis: usize) -> f64 {
        let (xyz, e) = match self {
            CoordMap::Cartesian(m) => (m.steps_per_mm, m.steps_per_mm_e),
            CoordMap::Delta(m) => (m.steps_per_mm, m.steps_per_mm_e),
        };
        if axis == AXIS_E {
            e
        } else {
            xyz
        }
    }

    fn level(&self) -> &BedLevel {
        match self {
            CoordMap::Cartesian(m) => &m.level,
            CoordMap::Delta(m) => &m.level,
        }
    }

    /// Apply the bed-leveling rotation to a host-frame point or vector.
    pub fn to_physical(&self, p: [f64; 3]) -> [f64; 3] {
        self.level().apply(p)
    }

    pub fn tower(&self, index: usize) -> [f64; 2] {
        match self {
            CoordMap::Delta(m) => m.towers[index],
            CoordMap::Cartesian(_) => [0.0, 0.0],
        }
    }

    pub fn rod_length(&self) -> f64 {
        match self {
            CoordMap::Delta(m) => m.rod_length,
            CoordMap::Cartesian(_) => 0.0,
        }
    }

    /// Host cartesian (mm) → mechanical steps. `None` when the target is
    /// outside the machine's reachable volume.
    pub fn cartesian_to_mechanical(&self, x: f64, y: f64, z: f64, e: f64) -> Option<[i32; 4]> {
        match self {
            CoordMap::Cartesian(m) => {
                let p = m.level.apply([x, y, z]);
                Some([
                    (p[0] * m.steps_per_mm).round() as i32,
                    (p[1] * m.steps_per_mm).round() as i32,
                    (p[2] * m.steps_per_mm).round() as i32,
                    (e * m.steps_per_mm_e).round() as i32,
                ])
            }
            CoordMap::Delta(m) => {
                let p = m.level.apply([x, y, z]);
                if p[0].hypot(p[1]) > m.build_radius + 1e-9 {
                    return None;
                }
                let mut mech = [0i32; 4];
                for k in 0..3 {
                    let h = m.carriage_height(p, k);
                    if !h.is_finite() {
                        return None;
                    }
                    mech[k] = (h * m.steps_per_mm).round() as i32;
                }
                mech[AXIS_E] = (e * m.steps_per_mm_e).round() as i32;
                Some(mech)
            }
        }
    }

    /// Mechanical steps → host cartesian (x, y, z, e) in mm. Yields NaN
    /// coordinates when the carriage heights do not intersect.
    pub fn mechanical_to_cartesian(&self, mech: &[i32; 4]) -> (f64, f64, f64, f64) {
        let phys = self.physical_from_mechanical(mech);
        let host = self.level().unapply(phys);
        let e = mech[AXIS_E] as f64 / self.steps_per_mm(AXIS_E);
        (host[0], host[1], host[2], e)
    }

    /// Effector position in the physical (post-leveling) frame, from step
    /// counts. For the delta this intersects the three carriage spheres.
    pub fn physical_from_mechanical(&self, mech: &[i32; 4]) -> [f64; 3] {
        match self {
            CoordMap::Cartesian(m) => [
                mech[0] as f64 / m.steps_per_mm,
                mech[1] as f64 / m.steps_per_mm,
                mech[2] as f64 / m.steps_per_mm,
            ],
            CoordMap::Delta(m) => {
                let heights = [
                    mech[0] as f64 / m.steps_per_mm,
                    mech[1] as f64 / m.steps_per_mm,
                    mech[2] as f64 / m.steps_per_mm,
                ];
                m.effector_from_heights(heights)
            }
        }
    }

    /// Mechanical position after a completed homing pass. The extruder
    /// count is carried through untouched.
    pub fn home_position(&self, e_steps: i32) -> [i32; 4] {
        match self {
            CoordMap::Cartesian(_) => [0, 0, 0, e_steps],
            CoordMap::Delta(m) => {
                let h = (m.column_height * m.steps_per_mm).round() as i32;
                [h, h, h, e_steps]
            }
        }
    }

    /// Axes that home to an endstop (the extruder never does).
    pub fn homing_axes(&self) -> [bool; 4] {
        [true, true, true, false]
    }
}

impl DeltaMap {
    /// Carriage height for tower `k` placing the effector at physical `p`.
    /// NaN when the rod cannot span the horizontal offset.
    fn carriage_height(&self, p: [f64; 3], k: usize) -> f64 {
        let dx = p[0] - self.towers[k][0];
        let dy = p[1] - self.towers[k][1];
        (self.rod_length * self.rod_length - dx * dx - dy * dy).sqrt() + p[2]
    }

    /// Three-sphere intersection: carriages at `(tower_k, h_k)`, radius L.
    /// Of the two intersection points the effector is the lower one.
    fn effector_from_heights(&self, h: [f64; 3]) -> [f64; 3] {
        let p1 = [self.towers[0][0], self.towers[0][1], h[0]];
        let p2 = [self.towers[1][0], self.towers[1][1], h[1]];
        let p3 = [self.towers[2][0], self.towers[2][1], h[2]];

        let ex = normalize(sub(p2, p1));
        let p13 = sub(p3, p1);
        let i = dot(ex, p13);
        let ey = normalize(sub(p13, scale(ex, i)));
        let ez = cross(ex, ey);
        let d = norm(sub(p2, p1));
        let j = dot(ey, p13);

        // equal radii, so the x' plane bisects p1-p2
        let l2 = self.rod_length * self.rod_length;
        let xs = d / 2.0;
        let ys = (i * i + j * j) / (2.0 * j) - i * xs / j;
        let zs2 = l2 - xs * xs - ys * ys;
        let zs = zs2.sqrt(); // NaN when the spheres do not intersect

        let a = add(add(p1, add(scale(ex, xs), scale(ey, ys))), scale(ez, zs));
        let b = add(add(p1, add(scale(ex, xs), scale(ey, ys))), scale(ez, -zs));
        if a[2] <= b[2] {
            a
        } else {
            b
        }
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn normalize(a: [f64; 3]) -> [f64; 3] {
    scale(a, 1.0 / norm(a))
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_shared::config::BedLevelConfig;

    fn cartesian_config() -> Config {
        let mut config = Config::default();
        config.printer.kinematics = MachineKind::Cartesian;
        config.geometry.steps_per_m = 1000.0;
        config.geometry.steps_per_m_e = 1000.0;
        config
    }

    fn delta_config() -> Config {
        Config::default()
    }

    #[test]
    fn cartesian_round_trip() {
        let map = CoordMap::from_config(&cartesian_config());
        let mech = map.cartesian_to_mechanical(10.0, -4.0, 2.5, 1.0).unwrap();
        assert_eq!(mech, [10, -4, 3, 1]);
        let (x, y, z, e) = map.mechanical_to_cartesian(&mech);
        assert!((x - 10.0).abs() <= 1.0);
        assert!((y + 4.0).abs() <= 1.0);
        assert!((z - 2.5).abs() <= 1.0);
        assert!((e - 1.0).abs() <= 1.0);
    }

    #[test]
    fn delta_center_heights_are_equal() {
        let map = CoordMap::from_config(&delta_config());
        let mech = map.cartesian_to_mechanical(0.0, 0.0, 10.0, 0.0).unwrap();
        assert_eq!(mech[0], mech[1]);
        assert_eq!(mech[1], mech[2]);
        // h = z + sqrt(L² − R²) at the center
        let expected_mm = 10.0 + (221.0f64 * 221.0 - 111.0 * 111.0).sqrt();
        let spm = map.steps_per_mm(0);
        assert!((mech[0] as f64 / spm - expected_mm).abs() < 0.1);
    }

    #[test]
    fn delta_round_trip_within_one_step() {
        let map = CoordMap::from_config(&delta_config());
        let step_mm = 1.0 / map.steps_per_mm(0);
        for &(x, y, z) in &[(0.0, 0.0, 0.0), (30.0, -20.0, 55.0), (-40.0, 10.0, 120.0)] {
            let mech = map.cartesian_to_mechanical(x, y, z, 0.0).unwrap();
            let (rx, ry, rz, _) = map.mechanical_to_cartesian(&mech);
            let err = ((rx - x).powi(2) + (ry - y).powi(2) + (rz - z).powi(2)).sqrt();
            assert!(err < 2.0 * step_mm, "round trip error {err} at ({x},{y},{z})");
        }
    }

    #[test]
    fn delta_unreachable_target_is_none() {
        let map = CoordMap::from_config(&delta_config());
        assert!(map.cartesian_to_mechanical(500.0, 0.0, 0.0, 0.0).is_none());
    }

    #[test]
    fn delta_home_position_is_column_height() {
        let map = CoordMap::from_config(&delta_config());
        let home = map.home_position(7);
        let spm = map.steps_per_mm(0);
        assert_eq!(home[0], (467.2 * spm).round() as i32);
        assert_eq!(home[3], 7);
        // effector sits at the center below the carriages
        let (x, y, z, _) = map.mechanical_to_cartesian(&home);
        assert!(x.abs() < 0.1 && y.abs() < 0.1);
        let expected_z = 467.2 - (221.0f64 * 221.0 - 111.0 * 111.0).sqrt();
        assert!((z - expected_z).abs() < 0.1);
    }

    #[test]
    fn bed_level_transpose_inverts_rotation() {
        let mut config = cartesian_config();
        // small rotation about the y axis
        config.geometry.bed_level = Some(BedLevelConfig {
            numerators: [
                [999_975_003, 5_356, -7_070_522],
                [5_356, 999_998_852, 1_515_111],
                [7_070_522, -1_515_111, 999_973_855],
            ],
            denominator: 1_000_000_000,
        });
        let map = CoordMap::from_config(&config);
        let level = map.level();
        let p = [12.0, -7.0, 3.0];
        let back = level.unapply(level.apply(p));
        for k in 0..3 {
            assert!((back[k] - p[k]).abs() < 1e-4);
        }
    }
}
