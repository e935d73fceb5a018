//! Value transformations: polynomial calibration and configured expressions.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::expr::Expression;
use crate::sample::Value;

use super::{numeric_fields, Behavior, Input, NodeCore, NodeError, Output, SetupCtx};

/// Little-endian polynomial of the input value. The coefficients are the
/// runtime `transform` list: `[value]` outputs a constant, `[0, 1]` is the
/// identity, `[c, b, a]` a quadratic.
#[derive(Default)]
pub struct Polynomial;

#[async_trait]
impl Behavior for Polynomial {
    fn kind(&self) -> &'static str {
        "PolynomialNode"
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let coefficients: Vec<f64> = match core.config.get("transform") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                NodeError::BadParam(core.name.clone(), "transform".to_string(), e.to_string())
            })?,
            None => vec![0.0, 1.0],
        };
        let x = core.field_f64(input.newest(), core.input()?)?;
        let result = coefficients
            .iter()
            .enumerate()
            .map(|(i, a)| a * x.powi(i as i32))
            .sum();
        Ok(Output::Scalar(Value::Float(result)))
    }
}

/// Evaluates a configured expression over the inputs (`v`) and runtime
/// constants (`c`). See [`crate::expr`] for the grammar.
#[derive(Default)]
pub struct Eval {
    expression: Option<Expression>,
}

#[async_trait]
impl Behavior for Eval {
    fn kind(&self) -> &'static str {
        "EvalNode"
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        let operation = ctx.require_str(&core.name, "operation")?;
        self.expression = Some(Expression::parse(&operation)?);
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let expression = self
            .expression
            .as_ref()
            .ok_or_else(|| NodeError::Other(format!("{} was never set up", core.name)))?;
        let v = numeric_fields(input.newest(), &core.inputs())?;
        // constants arrive as numbers or number-shaped strings, the config
        // UI does not distinguish
        let mut c = BTreeMap::new();
        if let Some(serde_json::Value::Object(constants)) = core.config.get("c") {
            for (key, value) in constants {
                let number = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| {
                        NodeError::BadParam(
                            core.name.clone(),
                            format!("c.{}", key),
                            "not a number".to_string(),
                        )
                    })?;
                c.insert(key.clone(), number);
            }
        }
        Ok(Output::Scalar(Value::Float(expression.eval(&v, &c)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputVar;
    use crate::node::testutil::{test_services_with, RecordingSink};
    use crate::sample::Sample;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn core_with(inputs: InputVar) -> NodeCore {
        let services = test_services_with(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingSink::default()),
            "convert_t",
        );
        NodeCore::new("xform", Some(inputs), None, vec![], services)
    }

    fn setup_ctx(options: serde_json::Value) -> SetupCtx {
        SetupCtx {
            options: serde_json::from_value(options).unwrap(),
            sensor: None,
            influx: serde_json::from_value(serde_json::json!({"url": "http://x"})).unwrap(),
            alarm: serde_yaml::from_str(
                "{protocols: [[sms]], recipients: [[shifters]], silence_duration: [60], silence_duration_cant_send: 30, escalation_config: [3]}",
            )
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_polynomial_identity() {
        let mut node = Polynomial;
        let mut core = core_with(InputVar::One("x".to_string()));
        core.config = serde_json::from_value(serde_json::json!({"transform": [0, 1]})).unwrap();
        let input = Input::Newest(Sample::new(1.0).with("x", 3.25));
        let Output::Scalar(Value::Float(y)) = node.process(&mut core, &input).await.unwrap()
        else {
            panic!();
        };
        assert_eq!(y, 3.25);
    }

    #[tokio::test]
    async fn test_polynomial_quadratic_and_default() {
        let mut node = Polynomial;
        let mut core = core_with(InputVar::One("x".to_string()));
        core.config =
            serde_json::from_value(serde_json::json!({"transform": [1, 0, 2]})).unwrap();
        let input = Input::Newest(Sample::new(1.0).with("x", 3.0));
        let Output::Scalar(Value::Float(y)) = node.process(&mut core, &input).await.unwrap()
        else {
            panic!();
        };
        assert_eq!(y, 19.0);

        // no transform configured means identity
        core.config = Default::default();
        let Output::Scalar(Value::Float(y)) = node.process(&mut core, &input).await.unwrap()
        else {
            panic!();
        };
        assert_eq!(y, 3.0);
    }

    #[tokio::test]
    async fn test_eval_with_constants() {
        let mut node = Eval::default();
        let mut core = core_with(InputVar::Many(vec!["a".to_string(), "b".to_string()]));
        node.setup(
            &mut core,
            &setup_ctx(serde_json::json!({"operation": "(v.a > c.lo) && (v.b < c.hi)"})),
        )
        .await
        .unwrap();
        // string-typed constants are coerced
        core.config =
            serde_json::from_value(serde_json::json!({"c": {"lo": "2", "hi": 10}})).unwrap();
        let input = Input::Newest(Sample::new(1.0).with("a", 5.0).with("b", 3.0));
        let Output::Scalar(Value::Float(y)) = node.process(&mut core, &input).await.unwrap()
        else {
            panic!();
        };
        assert_eq!(y, 1.0);
    }

    #[tokio::test]
    async fn test_eval_rejects_bad_operation() {
        let mut node = Eval::default();
        let mut core = core_with(InputVar::One("a".to_string()));
        let result = node
            .setup(&mut core, &setup_ctx(serde_json::json!({"operation": "v.a +"})))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_eval_missing_input_field() {
        let mut node = Eval::default();
        let mut core = core_with(InputVar::One("a".to_string()));
        node.setup(&mut core, &setup_ctx(serde_json::json!({"operation": "v.a * 2"})))
            .await
            .unwrap();
        let input = Input::Newest(Sample::new(1.0).with("other", 5.0));
        assert!(matches!(
            node.process(&mut core, &input).await,
            Err(NodeError::MissingField(_))
        ));
    }
}
