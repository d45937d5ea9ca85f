//! Dynamic vector-space physics over retrieval candidates (C8).
//!
//! # Responsibility
//! - Lay candidates out in 3-D under query gravity, structural springs and
//!   conflict repulsion, then report convergence metrics.
//!
//! # Invariants
//! - Seeded initialization; identical inputs give identical layouts.
//! - Positions stay inside the `±max_distance` cube.
//! - Speeds never exceed `max_velocity`; the cap is fixed for the whole run.
//! - `converged` is only reported once every particle has come to rest under
//!   the forces acting on it.
//! - Cancellation returns the partial layout with `cancelled = true`.

use super::embedding::cosine_similarity;
use crate::cancel::CancellationToken;
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Vec3 = [f64; 3];

/// Metadata keys that tie particles to the same document structure.
const STRUCTURAL_KEYS: [&str; 3] = ["source_doc", "section_id", "paragraph_id"];
const FALLBACK_NEIGHBOURS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DvnsConfig {
    pub gravity_constant: f64,
    /// Pairwise attraction applies at or above this similarity.
    pub attraction_threshold: f64,
    pub min_distance: f64,
    pub spring_constant: f64,
    pub rest_length: f64,
    pub repulsion_strength: f64,
    pub repulsion_epsilon: f64,
    /// Pairs at or below this similarity repel.
    pub repulsion_threshold: f64,
    /// Applied implicitly in the velocity update, so heavy damping stays stable.
    pub damping: f64,
    pub dt: f64,
    pub max_iterations: usize,
    pub max_distance: f64,
    pub max_velocity: f64,
    pub velocity_threshold: f64,
    pub displacement_threshold: f64,
    pub seed: u64,
}

impl Default for DvnsConfig {
    fn default() -> Self {
        Self {
            gravity_constant: 0.1,
            attraction_threshold: 0.7,
            min_distance: 0.05,
            spring_constant: 0.5,
            rest_length: 1.0,
            repulsion_strength: 0.5,
            repulsion_epsilon: 0.01,
            repulsion_threshold: -0.3,
            damping: 12.0,
            dt: 0.1,
            max_iterations: 100,
            max_distance: 10.0,
            max_velocity: 5.0,
            velocity_threshold: 0.1,
            displacement_threshold: 0.01,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub id: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub mass: f64,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Particle {
    /// Particle at rest at the origin; mass is `relevance` floored at 0.01.
    pub fn new(id: impl Into<String>, embedding: Vec<f32>, relevance: f64) -> Self {
        Self {
            id: id.into(),
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass: mass_for(relevance),
            embedding,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    fn conflicts_with(&self, other: &Particle) -> bool {
        match self.metadata.get("conflict_with") {
            Some(Value::String(id)) => id == &other.id,
            Some(Value::Array(ids)) => ids.iter().any(|id| id.as_str() == Some(&other.id)),
            _ => false,
        }
    }

    fn shares_structure(&self, other: &Particle) -> bool {
        STRUCTURAL_KEYS.iter().any(|key| {
            match (self.metadata.get(*key), other.metadata.get(*key)) {
                (Some(Value::String(left)), Some(Value::String(right))) => left == right,
                _ => false,
            }
        })
    }
}

pub fn mass_for(relevance: f64) -> f64 {
    if relevance.is_finite() {
        relevance.max(0.01)
    } else {
        0.01
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationMetrics {
    pub iterations: usize,
    pub converged: bool,
    pub max_velocity: f64,
    pub avg_velocity: f64,
    pub avg_displacement: f64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DvnsOutcome {
    pub particles: Vec<Particle>,
    pub metrics: SimulationMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct DvnsEngine {
    config: DvnsConfig,
}

impl DvnsEngine {
    pub fn new(config: DvnsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DvnsConfig {
        &self.config
    }

    /// Runs the simulation from seeded positions until convergence,
    /// `max_iterations` or cancellation.
    pub fn optimize_layout(
        &self,
        mut particles: Vec<Particle>,
        query_embedding: &[f32],
        cancel: &CancellationToken,
    ) -> DvnsOutcome {
        let config = &self.config;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        for particle in &mut particles {
            for axis in &mut particle.position {
                *axis = rng.gen_range(-1.0..=1.0);
            }
            particle.velocity = [0.0; 3];
        }

        let mut metrics = SimulationMetrics::default();
        if particles.is_empty() {
            metrics.converged = true;
            return DvnsOutcome { particles, metrics };
        }

        let query_position = query_point(query_embedding);
        let query_similarity: Vec<f64> = particles
            .iter()
            .map(|particle| cosine_similarity(&particle.embedding, query_embedding))
            .collect();
        let similarity = similarity_matrix(&particles);
        let neighbours = neighbour_lists(&particles, &similarity);

        for iteration in 0..config.max_iterations {
            if cancel.is_cancelled() {
                metrics.cancelled = true;
                break;
            }
            let forces: Vec<Vec3> = (0..particles.len())
                .map(|i| {
                    self.net_force(
                        i,
                        &particles,
                        &query_position,
                        query_similarity[i],
                        &similarity,
                        &neighbours[i],
                    )
                })
                .collect();

            let mut max_speed: f64 = 0.0;
            let mut speed_sum = 0.0;
            let mut displacement_sum = 0.0;
            for (particle, force) in particles.iter_mut().zip(&forces) {
                let before = particle.position;
                let drag = 1.0 + config.damping * config.dt / particle.mass;
                for axis in 0..3 {
                    particle.velocity[axis] =
                        (particle.velocity[axis] + force[axis] / particle.mass * config.dt) / drag;
                }
                clamp_magnitude(&mut particle.velocity, config.max_velocity);
                for axis in 0..3 {
                    particle.position[axis] = (particle.position[axis]
                        + particle.velocity[axis] * config.dt)
                        .clamp(-config.max_distance, config.max_distance);
                }
                let speed = norm(&particle.velocity);
                max_speed = max_speed.max(speed);
                speed_sum += speed;
                displacement_sum += distance(&before, &particle.position);
            }

            let count = particles.len() as f64;
            metrics.iterations = iteration + 1;
            metrics.max_velocity = max_speed;
            metrics.avg_velocity = speed_sum / count;
            metrics.avg_displacement = displacement_sum / count;
            if max_speed < config.velocity_threshold
                && metrics.avg_displacement < config.displacement_threshold
            {
                metrics.converged = true;
                break;
            }
        }

        debug!(
            "event=dvns_layout module=hhni status={} particles={} iterations={} converged={}",
            if metrics.cancelled { "cancelled" } else { "ok" },
            particles.len(),
            metrics.iterations,
            metrics.converged
        );
        DvnsOutcome { particles, metrics }
    }

    fn net_force(
        &self,
        i: usize,
        particles: &[Particle],
        query_position: &Vec3,
        query_similarity: f64,
        similarity: &[Vec<f64>],
        neighbours: &[usize],
    ) -> Vec3 {
        let config = &self.config;
        let particle = &particles[i];
        let mut force = [0.0; 3];

        if query_similarity > 0.0 {
            let pull = self.gravity(
                &particle.position,
                query_position,
                particle.mass,
                query_similarity,
            );
            add(&mut force, &pull);
        }

        for (j, other) in particles.iter().enumerate() {
            if j == i {
                continue;
            }
            let sim = similarity[i][j];
            if sim >= config.attraction_threshold {
                let pull = self.gravity(
                    &particle.position,
                    &other.position,
                    particle.mass,
                    sim,
                );
                add(&mut force, &pull);
            }
            let conflicting = particle.conflicts_with(other) || other.conflicts_with(particle);
            if sim <= config.repulsion_threshold || conflicting {
                let (direction, d) = direction_to(&other.position, &particle.position);
                let magnitude = config.repulsion_strength / (d * d + config.repulsion_epsilon);
                add(&mut force, &scale(&direction, magnitude));
            }
        }

        for &j in neighbours {
            let (direction, d) = direction_to(&particle.position, &particles[j].position);
            let magnitude = config.spring_constant * (d - config.rest_length);
            add(&mut force, &scale(&direction, magnitude));
        }
        force
    }

    /// `G * mass * sim / max(d, min_distance)^2` toward `target`.
    fn gravity(&self, from: &Vec3, target: &Vec3, mass: f64, sim: f64) -> Vec3 {
        let (direction, d) = direction_to(from, target);
        let d = d.max(self.config.min_distance);
        scale(&direction, self.config.gravity_constant * mass * sim / (d * d))
    }
}

fn query_point(embedding: &[f32]) -> Vec3 {
    let mut point = [0.0; 3];
    for (axis, value) in point.iter_mut().zip(embedding) {
        *axis = f64::from(*value);
    }
    point
}

fn similarity_matrix(particles: &[Particle]) -> Vec<Vec<f64>> {
    particles
        .iter()
        .map(|left| {
            particles
                .iter()
                .map(|right| cosine_similarity(&left.embedding, &right.embedding))
                .collect()
        })
        .collect()
}

/// Structural neighbours, else the two most similar particles.
fn neighbour_lists(particles: &[Particle], similarity: &[Vec<f64>]) -> Vec<Vec<usize>> {
    (0..particles.len())
        .map(|i| {
            let structural: Vec<usize> = (0..particles.len())
                .filter(|&j| j != i && particles[i].shares_structure(&particles[j]))
                .collect();
            if !structural.is_empty() {
                return structural;
            }
            let mut others: Vec<usize> = (0..particles.len()).filter(|&j| j != i).collect();
            others.sort_by(|&a, &b| similarity[i][b].total_cmp(&similarity[i][a]));
            others.truncate(FALLBACK_NEIGHBOURS);
            others
        })
        .collect()
}

/// Unit vector from `from` to `to` and the distance between them.
fn direction_to(from: &Vec3, to: &Vec3) -> (Vec3, f64) {
    let delta = [to[0] - from[0], to[1] - from[1], to[2] - from[2]];
    let d = norm(&delta);
    if d <= f64::EPSILON {
        return ([0.0; 3], 0.0);
    }
    (scale(&delta, 1.0 / d), d)
}

fn norm(v: &Vec3) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn distance(a: &Vec3, b: &Vec3) -> f64 {
    norm(&[a[0] - b[0], a[1] - b[1], a[2] - b[2]])
}

fn scale(v: &Vec3, factor: f64) -> Vec3 {
    [v[0] * factor, v[1] * factor, v[2] * factor]
}

fn add(target: &mut Vec3, v: &Vec3) {
    for axis in 0..3 {
        target[axis] += v[axis];
    }
}

fn clamp_magnitude(v: &mut Vec3, max: f64) {
    let magnitude = norm(v);
    if magnitude > max && magnitude > 0.0 {
        *v = scale(v, max / magnitude);
    }
}

#[cfg(test)]
mod tests {
    use super::{mass_for, norm, similarity_matrix, DvnsConfig, DvnsEngine, Particle};
    use crate::cancel::CancellationToken;
    use serde_json::{json, Map};

    fn particles() -> Vec<Particle> {
        vec![
            Particle::new("a", vec![1.0, 0.0, 0.0], 0.9),
            Particle::new("b", vec![0.9, 0.1, 0.0], 0.5),
            Particle::new("c", vec![-1.0, 0.0, 0.0], 0.2),
        ]
    }

    #[test]
    fn same_seed_gives_identical_layouts() {
        let engine = DvnsEngine::default();
        let token = CancellationToken::new();
        let first = engine.optimize_layout(particles(), &[1.0, 0.0, 0.0], &token);
        let second = engine.optimize_layout(particles(), &[1.0, 0.0, 0.0], &token);
        assert_eq!(first, second);
    }

    fn same_section(id: &str, embedding: Vec<f32>, relevance: f64) -> Particle {
        let mut metadata = Map::new();
        metadata.insert("source_doc".into(), json!("doc"));
        metadata.insert("section_id".into(), json!("doc/s0"));
        Particle::new(id, embedding, relevance).with_metadata(metadata)
    }

    #[test]
    fn section_settles_within_twenty_iterations_at_a_fixed_cap() {
        let config = DvnsConfig {
            max_iterations: 20,
            ..DvnsConfig::default()
        };
        let particles = vec![
            same_section("p1", vec![0.9, 0.436, 0.0], 0.9),
            same_section("p2", vec![0.6, 0.0, 0.8], 0.6),
            same_section("p3", vec![0.4, -0.9165, 0.0], 0.4),
        ];
        let outcome = DvnsEngine::new(config).optimize_layout(
            particles,
            &[1.0, 0.0, 0.0],
            &CancellationToken::new(),
        );
        assert!(outcome.metrics.converged);
        assert!(outcome.metrics.iterations <= 20);
        assert!(outcome.metrics.max_velocity < config.velocity_threshold);
        assert!(outcome.metrics.avg_displacement < config.displacement_threshold);
        for particle in &outcome.particles {
            assert!(particle.position.iter().all(|axis| axis.abs() <= 10.0));
        }
    }

    #[test]
    fn velocity_cap_holds_on_every_step() {
        let config = DvnsConfig {
            repulsion_strength: 1.0e6,
            max_velocity: 0.5,
            ..DvnsConfig::default()
        };
        for steps in [1, 5, 10] {
            let engine = DvnsEngine::new(DvnsConfig {
                max_iterations: steps,
                ..config
            });
            let outcome =
                engine.optimize_layout(particles(), &[1.0, 0.0, 0.0], &CancellationToken::new());
            assert!(!outcome.metrics.converged);
            for particle in &outcome.particles {
                assert!(norm(&particle.velocity) <= config.max_velocity + 1e-9);
            }
            // "c" is pushed away from "a" hard enough to ride the cap.
            let pushed = &outcome.particles[2];
            assert!((norm(&pushed.velocity) - config.max_velocity).abs() < 1e-9);
        }
    }

    #[test]
    fn pairwise_gravity_scales_with_the_pulled_particle_mass() {
        let mut heavy = Particle::new("heavy", vec![1.0, 0.0, 0.0], 0.5);
        let mut light = Particle::new("light", vec![1.0, 0.0, 0.0], 0.2);
        heavy.position = [0.0, 0.0, 0.0];
        light.position = [1.0, 0.0, 0.0];
        let particles = vec![heavy, light];
        let similarity = similarity_matrix(&particles);
        let engine = DvnsEngine::default();

        let on_heavy = engine.net_force(0, &particles, &[0.0; 3], 0.0, &similarity, &[]);
        let on_light = engine.net_force(1, &particles, &[0.0; 3], 0.0, &similarity, &[]);
        assert!((on_heavy[0] - 0.1 * 0.5).abs() < 1e-9);
        assert!((on_light[0] + 0.1 * 0.2).abs() < 1e-9);
        assert_eq!(on_heavy[1], 0.0);
    }

    #[test]
    fn cancellation_returns_partial_metrics() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = DvnsEngine::default().optimize_layout(particles(), &[1.0, 0.0, 0.0], &token);
        assert!(outcome.metrics.cancelled);
        assert_eq!(outcome.metrics.iterations, 0);
        assert_eq!(outcome.particles.len(), 3);
    }

    #[test]
    fn mass_is_floored() {
        assert_eq!(mass_for(0.0), 0.01);
        assert_eq!(mass_for(f64::NAN), 0.01);
        assert_eq!(mass_for(0.4), 0.4);
    }
}
