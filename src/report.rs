use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::pointcut::{PointcutKind, PointcutModel};

/// Summary of a run, written by `--report`.
#[derive(Debug, Serialize)]
pub(crate) struct RunReport {
    pub(crate) aspects: usize,
    pub(crate) pointcuts: PointcutCounts,
    pub(crate) inputs: Vec<InputReport>,
}

#[derive(Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct PointcutCounts {
    pub(crate) call: usize,
    pub(crate) execute: usize,
    pub(crate) super_execute: usize,
}

impl PointcutCounts {
    pub(crate) fn from_model(model: &PointcutModel) -> Self {
        Self {
            call: model.method_count(PointcutKind::Call),
            execute: model.method_count(PointcutKind::Execute),
            super_execute: model.method_count(PointcutKind::SuperExecute),
        }
    }
}

/// Outcome of weaving one input.
#[derive(Debug, Default, Serialize)]
pub(crate) struct InputReport {
    pub(crate) input: String,
    pub(crate) output: String,
    pub(crate) classes: usize,
    pub(crate) unchanged: usize,
    pub(crate) excluded: usize,
    pub(crate) woven: Vec<String>,
    pub(crate) failed: Vec<FailedClass>,
}

#[derive(Debug, Eq, PartialEq, Serialize)]
pub(crate) struct FailedClass {
    pub(crate) location: String,
    pub(crate) message: String,
}

impl RunReport {
    pub(crate) fn woven_count(&self) -> usize {
        self.inputs.iter().map(|input| input.woven.len()).sum()
    }

    pub(crate) fn failed_count(&self) -> usize {
        self.inputs.iter().map(|input| input.failed.len()).sum()
    }

    pub(crate) fn write_json(&self, writer: &mut dyn Write) -> Result<()> {
        serde_json::to_writer_pretty(&mut *writer, self).context("failed to serialize report")?;
        writer.write_all(b"\n").context("failed to write report")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointcut::{AdviceBinding, AdviceTiming, PointcutModelBuilder};

    #[test]
    fn report_serializes_counts_and_failures() {
        let mut builder = PointcutModelBuilder::new();
        builder.register(
            PointcutKind::Call,
            "com/example/A",
            "foo",
            "(I)V",
            AdviceBinding {
                aspect: "com/example/Aspect".to_string(),
                method: "afterFoo".to_string(),
                descriptor: "(Lcom/example/A;I)V".to_string(),
                timing: AdviceTiming::After,
            },
        );
        let report = RunReport {
            aspects: 1,
            pointcuts: PointcutCounts::from_model(&builder.build()),
            inputs: vec![InputReport {
                input: "app.jar".to_string(),
                output: "out/app.jar".to_string(),
                classes: 3,
                unchanged: 1,
                excluded: 0,
                woven: vec!["com/example/C".to_string()],
                failed: vec![FailedClass {
                    location: "com/example/Bad.class".to_string(),
                    message: "parse class".to_string(),
                }],
            }],
        };

        let mut out = Vec::new();
        report.write_json(&mut out).expect("write report");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");

        assert_eq!(value["pointcuts"]["call"], 1);
        assert_eq!(value["pointcuts"]["super_execute"], 0);
        assert_eq!(value["inputs"][0]["woven"][0], "com/example/C");
        assert_eq!(value["inputs"][0]["failed"][0]["location"], "com/example/Bad.class");
        assert_eq!(report.woven_count(), 1);
        assert_eq!(report.failed_count(), 1);
    }
}
