//! The propagator: orchestrates the full parameter-to-likelihood pipeline.
//!
//! Propagation runs as a fixed sequence of phases separated by pool
//! barriers: reset and evaluate the spline scratch, fold spline factors into
//! the weight aggregator, reweight events, refill histograms, update the
//! likelihood cache. Every phase partitions its work round-robin over the
//! same worker count, so a full propagation is bit-reproducible for any
//! pool size.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use df_cache::{CompactSplineCache, ParameterBank, SpaceOption, WeightAggregator};
use df_core::{Error, LikelihoodBreakdown, ObjectiveFunction, Result, ScanPoint, ScanResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::binning::{BinCondition, BinEdges, Binning};
use crate::config::{DialKindConfig, FitConfig, StrategyConfig};
use crate::dial::{Dial, DialId, DialKind, DialTable};
use crate::likelihood::LikelihoodCache;
use crate::parset::ParameterSet;
use crate::response::ResponseFunctions;
use crate::sample::Sample;
use crate::worker::WorkerPool;

/// How `propagate` rebuilds the MC histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStrategy {
    /// Full per-event reweighting through the dial caches.
    Direct,
    /// Linearized bin-level response functions anchored at +1 sigma.
    ResponseFunction,
}

impl From<StrategyConfig> for PropagationStrategy {
    fn from(config: StrategyConfig) -> Self {
        match config {
            StrategyConfig::Direct => PropagationStrategy::Direct,
            StrategyConfig::ResponseFunction => PropagationStrategy::ResponseFunction,
        }
    }
}

/// Cumulative wall-clock spent in one propagation phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseTimer {
    pub calls: u64,
    pub total: Duration,
}

impl PhaseTimer {
    fn record(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total += elapsed;
    }
}

/// Cumulative phase timings since construction.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropagationTimers {
    pub reweight: PhaseTimer,
    pub refill: PhaseTimer,
}

/// The full propagation pipeline for one fit model.
#[derive(Debug)]
pub struct Propagator {
    leaf_names: Vec<String>,
    parameter_names: Vec<String>,
    bank: ParameterBank,
    parameter_sets: Vec<ParameterSet>,
    dials: DialTable,
    /// Dial ids per global parameter, in configuration order.
    parameter_dials: Vec<Vec<DialId>>,
    samples: Vec<Sample>,
    weights: WeightAggregator,
    spline_cache: CompactSplineCache,
    pool: WorkerPool,
    strategy: PropagationStrategy,
    response: Option<ResponseFunctions>,
    llh: LikelihoodCache,
    timers: PropagationTimers,
}

impl Propagator {
    /// Build and initialize the whole pipeline from a parsed config.
    ///
    /// On return the propagator sits at the prior point with nominal weights
    /// captured, data histograms filled and locked, the spline cache
    /// finalized and the likelihood cache valid.
    pub fn from_config(config: &FitConfig) -> Result<Self> {
        let (bank, parameter_names, parameter_sets, dials, parameter_dials) =
            build_parameters(config)?;
        let samples = build_samples(config)?;
        let pool = WorkerPool::new(config.n_workers)?;

        let total_mc_events: usize = samples.iter().map(|s| s.mc.events.len()).sum();
        let mut propagator = Self {
            leaf_names: config.leaf_names.clone(),
            parameter_names,
            bank,
            parameter_sets,
            dials,
            parameter_dials,
            samples,
            weights: WeightAggregator::new(total_mc_events),
            spline_cache: CompactSplineCache::default(),
            pool,
            strategy: config.strategy.into(),
            response: None,
            llh: LikelihoodCache::new(),
            timers: PropagationTimers::default(),
        };
        propagator.initialize(config)?;
        Ok(propagator)
    }

    fn initialize(&mut self, config: &FitConfig) -> Result<()> {
        self.assign_result_slots();
        self.fill_event_dial_caches();
        self.build_spline_cache()?;

        for sample in &mut self.samples {
            let binning = sample.binning.clone();
            sample.mc.update_bin_event_list(&binning);
        }

        // First propagation at the priors defines the nominal point.
        self.bank.move_to_priors();
        self.propagate_direct();
        for sample in &mut self.samples {
            sample.mc.events.capture_nominal_weights();
        }

        self.build_data(config)?;
        self.llh.rebuild_data_refs(&self.samples);

        if self.strategy == PropagationStrategy::ResponseFunction {
            self.make_response_functions();
        }
        self.propagate()?;

        let n_splines = self.spline_cache.splines_used();
        info!(
            samples = self.samples.len(),
            parameters = self.bank.len(),
            mc_events = self.weights.len(),
            splines = n_splines,
            workers = self.pool.n_workers(),
            "propagator initialized"
        );
        Ok(())
    }

    /// Give every MC event a unique aggregator slot, numbered across samples
    /// in storage order.
    fn assign_result_slots(&mut self) {
        let mut slot = 0usize;
        for sample in &mut self.samples {
            for event in 0..sample.mc.events.len() {
                sample.mc.events.set_result_slot(event, slot);
                slot += 1;
            }
        }
    }

    /// Resolve which dials apply to which events, in parallel. Slots are
    /// filled front-to-back per event; set and parameter order is fixed by
    /// the configuration, so the caches come out identical for any worker
    /// count.
    fn fill_event_dial_caches(&mut self) {
        let stride: usize = self.parameter_sets.iter().map(|set| set.dial_slots()).sum();
        for sample in &mut self.samples {
            sample.mc.events.allocate_dial_cache(stride);
        }

        let n = self.pool.n_workers();
        let samples = &self.samples;
        let sets = &self.parameter_sets;
        let dials = &self.dials;
        let parameter_dials = &self.parameter_dials;
        self.pool.run(|worker| {
            for sample in samples {
                let events = &sample.mc.events;
                let mut event = worker;
                while event < events.len() {
                    let leaves = events.leaves(event);
                    let dataset = events.dataset(event);
                    let mut slot = 0usize;
                    for set in sets {
                        let one_dial = set.use_only_one_dial_per_event();
                        for &parameter in set.indices() {
                            let applicable = parameter_dials[parameter]
                                .iter()
                                .copied()
                                .find(|&id| dials.get(id).applies_to(dataset, leaves));
                            if let Some(id) = applicable {
                                events.assign_dial(event, slot, id);
                                slot += 1;
                                if one_dial {
                                    break;
                                }
                            }
                        }
                    }
                    event += n;
                }
            }
        });
    }

    /// Census the per-event spline assignments and load them into the
    /// compact-spline cache, one record per (event, spline dial) pair, in
    /// deterministic storage order.
    fn build_spline_cache(&mut self) -> Result<()> {
        let mut n_splines = 0usize;
        let mut n_points = 0usize;
        for sample in &self.samples {
            let events = &sample.mc.events;
            for event in 0..events.len() {
                for id in events.dial_refs(event) {
                    if let DialKind::CompactSpline { raw_points } = &self.dials.get(id).kind {
                        n_splines += 1;
                        n_points += raw_points.len() - 2;
                    }
                }
            }
        }

        let mut cache = CompactSplineCache::reserve(
            self.bank.len(),
            self.weights.len(),
            n_splines,
            n_points,
            SpaceOption::Points,
        )?;
        for sample in &self.samples {
            let events = &sample.mc.events;
            for event in 0..events.len() {
                for id in events.dial_refs(event) {
                    let dial = self.dials.get(id);
                    if let DialKind::CompactSpline { raw_points } = &dial.kind {
                        cache.add_spline(events.result_slot(event), dial.parameter, raw_points)?;
                    }
                }
            }
        }
        cache.finalize();
        debug!(
            splines = cache.splines_used(),
            knot_space = cache.space_used(),
            "spline cache loaded"
        );
        self.spline_cache = cache;
        Ok(())
    }

    /// Fill, optionally fluctuate, and lock the data histograms.
    fn build_data(&mut self, config: &FitConfig) -> Result<()> {
        for (sample, sample_config) in self.samples.iter_mut().zip(&config.samples) {
            match &sample_config.data_events {
                Some(events) => {
                    for event in events {
                        sample.data.events.push(
                            &event.leaves,
                            event.weight,
                            event.dataset as u32,
                        )?;
                    }
                }
                None => sample.build_asimov_data()?,
            }
            let binning = sample.binning.clone();
            sample.data.update_bin_event_list(&binning);
            sample.data.refill_partition(0, 1);
            sample.data.rescale_histogram();
            if sample_config.data_events.is_none() {
                if let Some(seed) = config.stat_fluctuation_seed {
                    let mut rng = StdRng::seed_from_u64(seed);
                    sample.data.apply_stat_fluctuation(&mut rng)?;
                }
            }
            sample.data.lock();
        }
        Ok(())
    }

    pub fn n_parameters(&self) -> usize {
        self.bank.len()
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn leaf_names(&self) -> &[String] {
        &self.leaf_names
    }

    /// Global index of a parameter by name.
    pub fn parameter_index(&self, name: &str) -> Result<usize> {
        self.parameter_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::Validation(format!("unknown parameter '{name}'")))
    }

    pub fn bank(&self) -> &ParameterBank {
        &self.bank
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn strategy(&self) -> PropagationStrategy {
        self.strategy
    }

    pub fn timers(&self) -> PropagationTimers {
        self.timers
    }

    /// Set one parameter. Invalidates the likelihood cache until the next
    /// propagation.
    pub fn set_parameter(&mut self, index: usize, value: f64) -> Result<()> {
        if index >= self.bank.len() {
            return Err(Error::Validation(format!(
                "parameter index {index} out of range ({} parameters)",
                self.bank.len()
            )));
        }
        self.bank.set_value(index, value);
        self.llh.invalidate();
        Ok(())
    }

    /// Set the full parameter vector.
    pub fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        self.bank.set_values(values)?;
        self.llh.invalidate();
        Ok(())
    }

    /// Move every parameter back to its prior.
    pub fn move_to_priors(&mut self) {
        self.bank.move_to_priors();
        self.llh.invalidate();
    }

    /// Propagate the current parameter point through to a valid likelihood
    /// cache.
    pub fn propagate(&mut self) -> Result<()> {
        match self.strategy {
            PropagationStrategy::Direct => self.propagate_direct(),
            PropagationStrategy::ResponseFunction => self.propagate_response()?,
        }
        self.llh.update(&self.samples, &self.bank, &self.parameter_sets);
        Ok(())
    }

    /// The direct pipeline: spline cache, event reweight, histogram refill.
    /// Leaves the likelihood cache stale; `propagate` finishes the job.
    fn propagate_direct(&mut self) {
        self.llh.invalidate();
        let n = self.pool.n_workers();
        let bank = &self.bank;
        let weights = &self.weights;
        let spline_cache = &self.spline_cache;
        let dials = &self.dials;
        let samples = &self.samples;
        let has_splines = spline_cache.splines_used() > 0;

        let start = Instant::now();
        self.pool.run(|worker| {
            weights.reset_partition(worker, n);
            if has_splines {
                spline_cache.evaluate_partition(bank, worker, n);
            }
        });
        if has_splines {
            // Barrier above guarantees the scratch is complete before any
            // slot product starts.
            self.pool.run(|worker| spline_cache.multiply_partition(weights, worker, n));
        }
        self.pool.run(|worker| {
            for sample in samples {
                sample.mc.events.reweight_partition(worker, n, dials, bank, weights);
            }
        });
        self.timers.reweight.record(start.elapsed());

        let start = Instant::now();
        self.pool.run(|worker| {
            for sample in samples {
                sample.mc.refill_partition(worker, n);
            }
        });
        for sample in samples {
            sample.mc.rescale_histogram();
        }
        self.timers.refill.record(start.elapsed());
    }

    /// The linearized pipeline: rebuild bins from the response functions.
    /// Event weights are not touched on this path.
    fn propagate_response(&mut self) -> Result<()> {
        self.llh.invalidate();
        let response = self.response.as_ref().ok_or_else(|| {
            Error::Computation("response functions requested but never built".into())
        })?;
        let n = self.pool.n_workers();
        let bank = &self.bank;
        let samples = &self.samples;
        let start = Instant::now();
        self.pool.run(|worker| response.apply_partition(samples, bank, worker, n));
        self.timers.refill.record(start.elapsed());
        Ok(())
    }

    /// Build the bin-level response functions by direct propagation: one
    /// nominal snapshot at the priors, then one +1 sigma excursion per
    /// parameter. Restores the prior point afterwards.
    pub fn make_response_functions(&mut self) {
        self.bank.move_to_priors();
        self.propagate_direct();
        let nominal: Vec<Vec<f64>> = self
            .samples
            .iter()
            .map(|sample| {
                let mut contents = Vec::new();
                sample.mc.histogram.snapshot_contents(&mut contents);
                contents
            })
            .collect();

        let mut deviations = Vec::with_capacity(self.bank.len());
        for parameter in 0..self.bank.len() {
            let prior = self.bank.prior(parameter);
            let sigma = self.bank.sigma(parameter);
            self.bank.set_value(parameter, prior + sigma);
            self.propagate_direct();
            let per_sample: Vec<Vec<f64>> = self
                .samples
                .iter()
                .enumerate()
                .map(|(sample_index, sample)| {
                    (0..sample.mc.histogram.n_bins())
                        .map(|bin| {
                            let base = nominal[sample_index][bin];
                            if base != 0.0 {
                                sample.mc.histogram.content(bin) / base - 1.0
                            } else {
                                0.0
                            }
                        })
                        .collect()
                })
                .collect();
            deviations.push(per_sample);
            self.bank.set_value(parameter, prior);
        }
        self.propagate_direct();
        debug!(parameters = deviations.len(), "response functions built");
        self.response = Some(ResponseFunctions::new(nominal, deviations));
    }

    /// Current likelihood components; errors if no propagation has run
    /// since the last parameter change.
    pub fn breakdown(&self) -> Result<LikelihoodBreakdown> {
        self.llh.breakdown()
    }

    /// Scan one parameter over an inclusive linear grid, restoring the
    /// original value afterwards.
    pub fn scan_parameter(
        &mut self,
        parameter: usize,
        from: f64,
        to: f64,
        n_points: usize,
    ) -> Result<ScanResult> {
        if parameter >= self.bank.len() {
            return Err(Error::Validation(format!(
                "parameter index {parameter} out of range ({} parameters)",
                self.bank.len()
            )));
        }
        if n_points < 2 {
            return Err(Error::Validation("scan needs at least two points".into()));
        }
        let saved = self.bank.value(parameter);
        let step = (to - from) / (n_points - 1) as f64;
        let mut points = Vec::with_capacity(n_points);
        for i in 0..n_points {
            let value = from + step * i as f64;
            self.set_parameter(parameter, value)?;
            self.propagate()?;
            let breakdown = self.breakdown()?;
            points.push(ScanPoint {
                value,
                stat: breakdown.stat,
                penalty: breakdown.penalty,
                total: breakdown.total(),
            });
        }
        self.set_parameter(parameter, saved)?;
        self.propagate()?;
        Ok(ScanResult { parameter_index: parameter, points })
    }

    /// Determinism self-test: throw correlated parameter vectors, then
    /// replay every one of them `n_replays` times in shuffled order and
    /// require bit-identical total likelihoods. Restores the original point
    /// afterwards.
    pub fn check_numerical_accuracy(
        &mut self,
        n_throws: usize,
        n_replays: usize,
        seed: u64,
    ) -> Result<()> {
        let saved = self.bank.values().to_vec();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut throws = Vec::with_capacity(n_throws);
        for _ in 0..n_throws {
            for set in &self.parameter_sets {
                set.throw_into(&mut self.bank, 1.0, &mut rng);
            }
            throws.push(self.bank.values().to_vec());
        }

        let mut reference: Vec<f64> = vec![0.0; n_throws];
        let mut order: Vec<usize> = (0..n_throws).collect();
        for replay in 0..n_replays {
            if replay > 0 {
                order.shuffle(&mut rng);
            }
            for &throw in &order {
                self.set_parameters(&throws[throw])?;
                self.propagate()?;
                let total = self.breakdown()?.total();
                if replay == 0 {
                    reference[throw] = total;
                } else if total.to_bits() != reference[throw].to_bits() {
                    let discrepancy = (total - reference[throw]).abs();
                    self.set_parameters(&saved)?;
                    self.propagate()?;
                    return Err(Error::NonDeterministic { discrepancy });
                }
            }
        }
        self.set_parameters(&saved)?;
        self.propagate()?;
        debug!(n_throws, n_replays, "numerical accuracy check passed");
        Ok(())
    }
}

/// Flatten the configured parameter sets into the bank, the dial arena and
/// the per-parameter dial lists.
#[allow(clippy::type_complexity)]
fn build_parameters(
    config: &FitConfig,
) -> Result<(
    ParameterBank,
    Vec<String>,
    Vec<ParameterSet>,
    DialTable,
    Vec<Vec<DialId>>,
)> {
    let mut names = Vec::new();
    let mut priors = Vec::new();
    let mut sigmas = Vec::new();
    let mut lower_clamps = Vec::new();
    let mut upper_clamps = Vec::new();
    let mut dials = DialTable::new();
    let mut parameter_dials: Vec<Vec<DialId>> = Vec::new();
    let mut sets = Vec::new();

    for set_config in &config.parameter_sets {
        let first = names.len();
        for parameter_config in &set_config.parameters {
            if names.contains(&parameter_config.name) {
                return Err(Error::Validation(format!(
                    "duplicate parameter name '{}'",
                    parameter_config.name
                )));
            }
            let parameter = names.len();
            names.push(parameter_config.name.clone());
            priors.push(parameter_config.prior);
            sigmas.push(parameter_config.sigma);
            lower_clamps.push(parameter_config.lower_clamp);
            upper_clamps.push(parameter_config.upper_clamp);

            let mut ids = Vec::with_capacity(parameter_config.dials.len());
            for dial_config in &parameter_config.dials {
                let condition = BinCondition {
                    edges: dial_config
                        .condition
                        .iter()
                        .map(|edge| {
                            Ok(BinEdges {
                                leaf: config.leaf_index(&edge.leaf)?,
                                low: edge.low,
                                high: edge.high,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                };
                let kind = match &dial_config.kind {
                    DialKindConfig::Norm => DialKind::Norm,
                    spline @ DialKindConfig::CompactSpline { .. } => {
                        // validated at parse time, raw_points is Some here
                        let raw_points = spline.raw_points().ok_or_else(|| {
                            Error::Validation("spline dial without raw points".into())
                        })?;
                        DialKind::CompactSpline { raw_points }
                    }
                };
                ids.push(dials.push(Dial {
                    parameter,
                    dataset: dial_config.dataset,
                    condition,
                    kind,
                }));
            }
            parameter_dials.push(ids);
        }
        let indices: Vec<usize> = (first..names.len()).collect();
        let covariance = set_config
            .covariance
            .as_ref()
            .map(|rows| {
                let n = indices.len();
                if rows.len() != n || rows.iter().any(|row| row.len() != n) {
                    return Err(Error::Validation(format!(
                        "parameter set '{}': covariance shape does not match {} parameters",
                        set_config.name, n
                    )));
                }
                Ok(nalgebra::DMatrix::from_fn(n, n, |r, c| rows[r][c]))
            })
            .transpose()?;
        sets.push(ParameterSet::new(
            set_config.name.clone(),
            indices,
            covariance,
            set_config.use_only_one_dial_per_event,
        )?);
    }

    let bank = ParameterBank::new(priors, sigmas, lower_clamps, upper_clamps)?;
    Ok((bank, names, sets, dials, parameter_dials))
}

/// Build the samples and load their MC events.
fn build_samples(config: &FitConfig) -> Result<Vec<Sample>> {
    let n_leaves = config.leaf_names.len();
    let mut samples = Vec::with_capacity(config.samples.len());
    for sample_config in &config.samples {
        let bins = sample_config
            .bins
            .iter()
            .map(|edges| {
                Ok(BinCondition {
                    edges: edges
                        .iter()
                        .map(|edge| {
                            Ok(BinEdges {
                                leaf: config.leaf_index(&edge.leaf)?,
                                low: edge.low,
                                high: edge.high,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut sample = Sample::new(sample_config.name.clone(), Binning::new(bins), n_leaves);
        sample.mc.hist_scale = sample_config.hist_scale;
        for event in &sample_config.mc_events {
            sample
                .mc
                .events
                .push(&event.leaves, event.weight, event.dataset as u32)?;
        }
        samples.push(sample);
    }
    Ok(samples)
}

/// Thread-safe objective adapter handed to external minimizers.
///
/// The propagator itself is single-owner mutable state; the adapter
/// serializes evaluations behind a mutex so drivers can hold `&FitObjective`
/// from several threads.
pub struct FitObjective {
    n_parameters: usize,
    inner: Mutex<Propagator>,
}

impl FitObjective {
    pub fn new(propagator: Propagator) -> Self {
        Self { n_parameters: propagator.n_parameters(), inner: Mutex::new(propagator) }
    }

    /// Take the propagator back out of the adapter.
    pub fn into_inner(self) -> Result<Propagator> {
        self.inner
            .into_inner()
            .map_err(|_| Error::Computation("propagator mutex poisoned".into()))
    }
}

impl ObjectiveFunction for FitObjective {
    fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    fn eval(&self, params: &[f64]) -> Result<f64> {
        let mut propagator = self
            .inner
            .lock()
            .map_err(|_| Error::Computation("propagator mutex poisoned".into()))?;
        propagator.set_parameters(params)?;
        propagator.propagate()?;
        Ok(propagator.breakdown()?.total())
    }
}
