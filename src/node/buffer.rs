//! Buffer nodes: vertices that process a span of history each cycle.
//!
//! Their buffer length is a runtime parameter (`length`), so operators can
//! widen a filter without restarting anything.

use async_trait::async_trait;

use crate::config::Document;
use crate::sample::{Sample, Value};

use super::{Behavior, Input, NodeCore, NodeError, Output, SetupCtx};

/// Pull `length` out of the runtime config and resize the buffer; the rest
/// of the document becomes the node's config.
fn load_length_config(core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
    let length = doc
        .get("length")
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .ok_or_else(|| NodeError::MissingParam(core.name.clone(), "length".to_string()))?;
    core.buffer.set_limit(length as usize);
    let mut config = doc.clone();
    config.remove("length");
    core.config = config;
    Ok(())
}

/// Median of the buffered values; the two central values are averaged for
/// even lengths.
#[derive(Default)]
pub struct MedianFilter {
    strict: bool,
}

#[async_trait]
impl Behavior for MedianFilter {
    fn kind(&self) -> &'static str {
        "MedianFilterNode"
    }

    fn uses_buffer(&self) -> bool {
        true
    }

    fn strict(&self) -> bool {
        self.strict
    }

    async fn setup(&mut self, _core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.strict = ctx.opt_bool("strict_length");
        Ok(())
    }

    fn load_config(&mut self, core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
        load_length_config(core, doc)
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let mut values = core.input_series(input.samples())?;
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = values.len();
        if n == 0 {
            return Err(NodeError::EmptyBuffer(core.name.clone()));
        }
        let median = if n % 2 == 0 {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        } else {
            values[n / 2]
        };
        Ok(Output::Scalar(Value::Float(median)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMethod {
    Avg,
    Min,
    Max,
    Newest,
    Oldest,
}

impl MergeMethod {
    fn parse(name: &str) -> Result<Self, String> {
        Ok(match name {
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "newest" => Self::Newest,
            "oldest" => Self::Oldest,
            other => {
                return Err(format!(
                    "invalid merge method '{}', must be avg, min, max, newest or oldest",
                    other
                ))
            }
        })
    }

    /// Merge a series ordered oldest to newest.
    fn merge(&self, values: &[f64]) -> f64 {
        match self {
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Newest => values[values.len() - 1],
            Self::Oldest => values[0],
        }
    }
}

/// Fan-in: combines one package from each upstream into a single package
/// without mangling timestamps. The buffer holds exactly one slot per
/// upstream and is cleared after every cycle.
pub struct Merge {
    method: MergeMethod,
}

impl Default for Merge {
    fn default() -> Self {
        Self {
            method: MergeMethod::Avg,
        }
    }
}

#[async_trait]
impl Behavior for Merge {
    fn kind(&self) -> &'static str {
        "MergeNode"
    }

    fn uses_buffer(&self) -> bool {
        true
    }

    fn strict(&self) -> bool {
        true
    }

    fn is_merge(&self) -> bool {
        true
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        if let Some(how) = ctx.opt_str("merge_how") {
            self.method = MergeMethod::parse(&how).map_err(|e| {
                NodeError::BadParam(core.name.clone(), "merge_how".to_string(), e)
            })?;
        }
        core.buffer.set_limit(core.upstream.len().max(1));
        Ok(())
    }

    // the buffer length is structural here, never a runtime parameter

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let samples = input.samples();
        if samples.is_empty() {
            return Err(NodeError::EmptyBuffer(core.name.clone()));
        }
        let times: Vec<f64> = samples.iter().map(|s| s.time).collect();
        let mut merged = Sample::new(self.method.merge(&times));

        // field names present in every package merge by method; numeric
        // merges only make sense for numbers, text takes the newest value
        let mut common: Vec<String> = samples[0].fields.keys().cloned().collect();
        common.retain(|key| samples.iter().all(|s| s.fields.contains_key(key)));
        for key in &common {
            if samples.iter().all(|s| s.get(key).is_some_and(Value::is_numeric)) {
                let series: Vec<f64> = samples
                    .iter()
                    .map(|s| s.get_f64(key).unwrap_or_default())
                    .collect();
                merged.set(key.clone(), self.method.merge(&series));
            } else if let Some(value) = samples[samples.len() - 1].get(key) {
                merged.set(key.clone(), value.clone());
            }
        }
        // everything else is carried over, newest occurrence winning
        for sample in samples {
            for (key, value) in &sample.fields {
                if !common.contains(key) {
                    merged.set(key.clone(), value.clone());
                }
            }
        }
        Ok(Output::Replace(merged))
    }

    fn post_process(&mut self, core: &mut NodeCore) {
        core.buffer.clear();
    }
}

/// Trapezoid-rule integral average of the input over the buffer, divided by
/// the spanned interval. `t_offset` skips the most recent samples.
#[derive(Default)]
pub struct Integral {
    strict: bool,
}

#[async_trait]
impl Behavior for Integral {
    fn kind(&self) -> &'static str {
        "IntegralNode"
    }

    fn uses_buffer(&self) -> bool {
        true
    }

    fn strict(&self) -> bool {
        self.strict
    }

    async fn setup(&mut self, _core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.strict = ctx.opt_bool("strict_length");
        Ok(())
    }

    fn load_config(&mut self, core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
        load_length_config(core, doc)
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let offset = core.config_usize("t_offset").unwrap_or(0);
        let samples = input.samples();
        let n = samples.len();
        if n < offset + 2 {
            return Err(NodeError::NotEnoughData(core.name.clone()));
        }
        let values = core.input_series(samples)?;
        let last = n - 1 - offset;
        let mut integral = 0.0;
        for i in 1..=last {
            integral += (samples[i].time - samples[i - 1].time) * (values[i] + values[i - 1]) * 0.5;
        }
        let span = samples[last].time - samples[0].time;
        if span == 0.0 {
            return Err(NodeError::NotEnoughData(core.name.clone()));
        }
        Ok(Output::Scalar(Value::Float(integral / span)))
    }
}

/// Slope of the input over the buffer from a chi-square linear fit, so a
/// single noisy sample doesn't swing the result.
#[derive(Default)]
pub struct Derivative {
    strict: bool,
}

#[async_trait]
impl Behavior for Derivative {
    fn kind(&self) -> &'static str {
        "DerivativeNode"
    }

    fn uses_buffer(&self) -> bool {
        true
    }

    fn strict(&self) -> bool {
        self.strict
    }

    async fn setup(&mut self, _core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.strict = ctx.opt_bool("strict_length");
        Ok(())
    }

    fn load_config(&mut self, core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
        load_length_config(core, doc)
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let samples = input.samples();
        if samples.len() < 2 {
            return Err(NodeError::NotEnoughData(core.name.clone()));
        }
        // shifting by the first timestamp keeps the products small
        let t_min = samples[0].time;
        let t: Vec<f64> = samples.iter().map(|s| s.time - t_min).collect();
        let y = core.input_series(samples)?;
        let b: f64 = t.iter().map(|v| v * v).sum();
        let c = samples.len() as f64;
        let d: f64 = t.iter().zip(&y).map(|(tt, yy)| tt * yy).sum();
        let e: f64 = y.iter().sum();
        let f: f64 = t.iter().sum();
        let denom = b * c - f * f;
        if denom.abs() < f64::EPSILON {
            return Err(NodeError::NotEnoughData(core.name.clone()));
        }
        Ok(Output::Scalar(Value::Float((d * c - e * f) / denom)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputVar;
    use crate::node::testutil::{test_services_with, RecordingSink};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn core() -> NodeCore {
        let services = test_services_with(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingSink::default()),
            "convert_t",
        );
        NodeCore::new(
            "buffered",
            Some(InputVar::One("x".to_string())),
            None,
            vec!["a".to_string(), "b".to_string()],
            services,
        )
    }

    fn buffered(values: &[(f64, f64)]) -> Input {
        Input::Buffer(
            values
                .iter()
                .map(|(t, v)| Sample::new(*t).with("x", *v))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_median_odd_and_even() {
        let mut node = MedianFilter::default();
        let mut c = core();
        let out = node
            .process(&mut c, &buffered(&[(1.0, 5.0), (2.0, 1.0), (3.0, 9.0)]))
            .await
            .unwrap();
        assert!(matches!(out, Output::Scalar(Value::Float(m)) if m == 5.0));
        let out = node
            .process(
                &mut c,
                &buffered(&[(1.0, 5.0), (2.0, 1.0), (3.0, 9.0), (4.0, 7.0)]),
            )
            .await
            .unwrap();
        assert!(matches!(out, Output::Scalar(Value::Float(m)) if m == 6.0));
    }

    #[tokio::test]
    async fn test_merge_avg_identity() {
        // identical upstream packages merge to themselves
        let mut node = Merge::default();
        let mut c = core();
        let input = Input::Buffer(vec![
            Sample::new(10.0).with("x", 4.0),
            Sample::new(10.0).with("x", 4.0),
        ]);
        let Output::Replace(merged) = node.process(&mut c, &input).await.unwrap() else {
            panic!("merge must replace the package");
        };
        assert_eq!(merged.time, 10.0);
        assert_eq!(merged.get_f64("x"), Some(4.0));
    }

    #[tokio::test]
    async fn test_merge_methods_and_disjoint_fields() {
        let mut c = core();
        let input = Input::Buffer(vec![
            Sample::new(10.0).with("x", 2.0).with("left", 1.0),
            Sample::new(20.0).with("x", 6.0).with("right", 2.0),
        ]);
        let mut node = Merge {
            method: MergeMethod::Max,
        };
        let Output::Replace(merged) = node.process(&mut c, &input).await.unwrap() else {
            panic!();
        };
        assert_eq!(merged.time, 20.0);
        assert_eq!(merged.get_f64("x"), Some(6.0));
        // disjoint fields are carried through untouched
        assert_eq!(merged.get_f64("left"), Some(1.0));
        assert_eq!(merged.get_f64("right"), Some(2.0));

        let mut node = Merge {
            method: MergeMethod::Oldest,
        };
        let Output::Replace(merged) = node.process(&mut c, &input).await.unwrap() else {
            panic!();
        };
        assert_eq!(merged.time, 10.0);
        assert_eq!(merged.get_f64("x"), Some(2.0));
    }

    #[tokio::test]
    async fn test_merge_text_field_takes_newest() {
        let mut c = core();
        let input = Input::Buffer(vec![
            Sample::new(10.0).with("status", "old"),
            Sample::new(20.0).with("status", "new"),
        ]);
        let mut node = Merge::default();
        let Output::Replace(merged) = node.process(&mut c, &input).await.unwrap() else {
            panic!();
        };
        assert_eq!(merged.get("status").unwrap().to_string(), "new");
    }

    #[tokio::test]
    async fn test_merge_clears_buffer_after_cycle() {
        let mut c = core();
        let mut node = Merge::default();
        c.buffer.add(Sample::new(1.0).with("x", 1.0));
        node.post_process(&mut c);
        assert!(c.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_integral_of_constant_is_constant() {
        let mut node = Integral::default();
        let mut c = core();
        let input = buffered(&[(0.0, 3.0), (5.0, 3.0), (10.0, 3.0), (15.0, 3.0)]);
        for offset in [0usize, 1] {
            c.config = serde_json::from_value(serde_json::json!({"t_offset": offset})).unwrap();
            let Output::Scalar(Value::Float(v)) = node.process(&mut c, &input).await.unwrap()
            else {
                panic!();
            };
            assert!((v - 3.0).abs() < 1e-12, "offset {}: {}", offset, v);
        }
    }

    #[tokio::test]
    async fn test_integral_needs_enough_samples() {
        let mut node = Integral::default();
        let mut c = core();
        c.config = serde_json::from_value(serde_json::json!({"t_offset": 3})).unwrap();
        let input = buffered(&[(0.0, 1.0), (1.0, 1.0), (2.0, 1.0)]);
        assert!(matches!(
            node.process(&mut c, &input).await,
            Err(NodeError::NotEnoughData(_))
        ));
    }

    #[tokio::test]
    async fn test_derivative_of_constant_is_zero() {
        let mut node = Derivative::default();
        let mut c = core();
        let input = buffered(&[(0.0, 7.0), (1.0, 7.0), (2.0, 7.0)]);
        let Output::Scalar(Value::Float(slope)) = node.process(&mut c, &input).await.unwrap()
        else {
            panic!();
        };
        assert!(slope.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_derivative_of_line_is_slope() {
        let mut node = Derivative::default();
        let mut c = core();
        let input = buffered(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0), (3.0, 7.0)]);
        let Output::Scalar(Value::Float(slope)) = node.process(&mut c, &input).await.unwrap()
        else {
            panic!();
        };
        assert!((slope - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_length_is_a_runtime_parameter() {
        let mut node = MedianFilter::default();
        let mut c = core();
        let doc: Document =
            serde_json::from_value(serde_json::json!({"length": 5, "other": 1})).unwrap();
        node.load_config(&mut c, &doc).unwrap();
        assert_eq!(c.buffer.limit(), Some(5));
        // length is consumed, the rest lands in the node config
        assert!(c.config.get("length").is_none());
        assert!(c.config.get("other").is_some());
        // and a missing length is a configuration error
        let doc: Document = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(node.load_config(&mut c, &doc).is_err());
    }
}
