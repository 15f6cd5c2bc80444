//! Post-load optimization pipeline
//!
//! Each optimization is an independent step folded over the model. A step
//! either hands back the (possibly replaced) model or skips, handing back the
//! model it was given. Nothing here can fail a load.

use serde::Serialize;

use crate::inference::backend::{BackendError, LanguageModel};
use crate::storage::settings::OptimizationSettings;

type Model = Box<dyn LanguageModel>;

/// Why a step left the model as it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Unsupported,
    Failed(String),
}

/// A step that did not apply, carrying the untouched model
pub struct Skipped {
    pub model: Model,
    pub reason: SkipReason,
}

impl Skipped {
    fn new(model: Model, reason: SkipReason) -> Self {
        Self { model, reason }
    }
}

type Step = fn(Model, &OptimizationSettings) -> Result<Model, Skipped>;

/// Outcome of one optimization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum OptimizationOutcome {
    Applied,
    Disabled,
    Unsupported,
    Failed(String),
}

impl std::fmt::Display for OptimizationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizationOutcome::Applied => f.write_str("applied"),
            OptimizationOutcome::Disabled => f.write_str("disabled"),
            OptimizationOutcome::Unsupported => f.write_str("unsupported"),
            OptimizationOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-optimization outcomes of one load, in pipeline order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationReport {
    pub entries: Vec<(String, OptimizationOutcome)>,
}

impl OptimizationReport {
    pub fn outcome(&self, name: &str) -> Option<&OptimizationOutcome> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn is_applied(&self, name: &str) -> bool {
        self.outcome(name) == Some(&OptimizationOutcome::Applied)
    }
}

/// Run a toggleable in-place hook if the model reports the capability
fn toggle(
    mut model: Model,
    enabled: bool,
    supported: bool,
    hook: fn(&mut (dyn LanguageModel + 'static)) -> Result<(), BackendError>,
) -> Result<Model, Skipped> {
    if !enabled {
        return Err(Skipped::new(model, SkipReason::Disabled));
    }
    if !supported {
        return Err(Skipped::new(model, SkipReason::Unsupported));
    }
    match hook(model.as_mut()) {
        Ok(()) => Ok(model),
        Err(e) => Err(Skipped::new(model, SkipReason::Failed(e.to_string()))),
    }
}

fn attention_slicing(model: Model, settings: &OptimizationSettings) -> Result<Model, Skipped> {
    let supported = model.capabilities().attention_slicing;
    toggle(model, settings.enable_attention_slicing, supported, |m| {
        m.enable_attention_slicing()
    })
}

fn cpu_offload(model: Model, settings: &OptimizationSettings) -> Result<Model, Skipped> {
    let supported = model.capabilities().cpu_offload;
    toggle(model, settings.enable_cpu_offloading, supported, |m| {
        m.enable_cpu_offload()
    })
}

fn graph_rewrite(model: Model, settings: &OptimizationSettings) -> Result<Model, Skipped> {
    if !settings.enable_better_transformer {
        return Err(Skipped::new(model, SkipReason::Disabled));
    }
    if !model.capabilities().graph_rewrite {
        return Err(Skipped::new(model, SkipReason::Unsupported));
    }
    model
        .rewrite_graph()
        .map_err(|(original, e)| Skipped::new(original, SkipReason::Failed(e.to_string())))
}

fn flash_attention(model: Model, settings: &OptimizationSettings) -> Result<Model, Skipped> {
    let supported = model.capabilities().flash_attention;
    toggle(model, settings.enable_flash_attention, supported, |m| {
        m.enable_flash_attention()
    })
}

fn memory_efficient_attention(
    model: Model,
    settings: &OptimizationSettings,
) -> Result<Model, Skipped> {
    let supported = model.capabilities().memory_efficient_attention;
    toggle(
        model,
        settings.enable_memory_efficient_attention,
        supported,
        |m| m.enable_memory_efficient_attention(),
    )
}

fn gradient_checkpointing(model: Model, settings: &OptimizationSettings) -> Result<Model, Skipped> {
    let supported = model.capabilities().gradient_checkpointing;
    toggle(model, settings.enable_gradient_checkpointing, supported, |m| {
        m.enable_gradient_checkpointing()
    })
}

/// Pipeline order
const STEPS: [(&str, Step); 6] = [
    ("attention_slicing", attention_slicing),
    ("cpu_offload", cpu_offload),
    ("better_transformer", graph_rewrite),
    ("flash_attention", flash_attention),
    ("memory_efficient_attention", memory_efficient_attention),
    ("gradient_checkpointing", gradient_checkpointing),
];

/// Apply every configured optimization, then switch the model to inference
/// mode. Always returns a usable model.
pub fn apply_optimizations(
    model: Model,
    settings: &OptimizationSettings,
) -> (Model, OptimizationReport) {
    let mut report = OptimizationReport::default();

    let mut model = STEPS.iter().fold(model, |model, (name, step)| {
        let (model, outcome) = match step(model, settings) {
            Ok(model) => {
                tracing::info!("Optimization {} applied", name);
                (model, OptimizationOutcome::Applied)
            }
            Err(Skipped { model, reason }) => {
                let outcome = match reason {
                    SkipReason::Disabled => {
                        tracing::debug!("Optimization {} disabled", name);
                        OptimizationOutcome::Disabled
                    }
                    SkipReason::Unsupported => {
                        tracing::info!("Optimization {} not available for this model", name);
                        OptimizationOutcome::Unsupported
                    }
                    SkipReason::Failed(e) => {
                        tracing::warn!("Optimization {} failed: {}", name, e);
                        OptimizationOutcome::Failed(e)
                    }
                };
                (model, outcome)
            }
        };
        report.entries.push((name.to_string(), outcome));
        model
    });

    model.set_inference_mode();
    tracing::info!("Model set to inference mode");

    (model, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::Capabilities;
    use crate::inference::fake::{FakeModel, FakeScript};

    fn all_on() -> OptimizationSettings {
        OptimizationSettings {
            enable_attention_slicing: true,
            enable_cpu_offloading: true,
            enable_better_transformer: true,
            enable_flash_attention: true,
            enable_memory_efficient_attention: true,
            enable_gradient_checkpointing: true,
            ..OptimizationSettings::default()
        }
    }

    fn model_with(capabilities: Capabilities) -> (Box<FakeModel>, FakeScript) {
        let script = FakeScript::default();
        let model = FakeModel::new(script.clone()).with_capabilities(capabilities);
        (Box::new(model), script)
    }

    #[test]
    fn test_disabled_steps_are_reported() {
        let (model, script) = model_with(Capabilities::default());
        let settings = OptimizationSettings {
            enable_memory_efficient_attention: false,
            enable_gradient_checkpointing: false,
            ..OptimizationSettings::default()
        };
        let (_model, report) = apply_optimizations(model, &settings);
        assert_eq!(report.entries.len(), STEPS.len());
        assert!(report
            .entries
            .iter()
            .all(|(_, o)| *o == OptimizationOutcome::Disabled));
        assert!(script.inference_mode());
    }

    #[test]
    fn test_unsupported_steps_pass_model_through() {
        let (model, script) = model_with(Capabilities {
            attention_slicing: true,
            ..Capabilities::default()
        });
        let (_model, report) = apply_optimizations(model, &all_on());
        assert!(report.is_applied("attention_slicing"));
        assert_eq!(
            report.outcome("flash_attention"),
            Some(&OptimizationOutcome::Unsupported)
        );
        assert_eq!(script.applied(), vec!["attention_slicing".to_string()]);
        assert!(script.inference_mode());
    }

    #[test]
    fn test_failed_step_keeps_model_and_continues() {
        let (model, script) = model_with(Capabilities {
            cpu_offload: true,
            graph_rewrite: true,
            gradient_checkpointing: true,
            ..Capabilities::default()
        });
        script.fail_optimization("better_transformer");
        let (_model, report) = apply_optimizations(model, &all_on());

        assert!(report.is_applied("cpu_offload"));
        assert!(matches!(
            report.outcome("better_transformer"),
            Some(OptimizationOutcome::Failed(_))
        ));
        assert!(report.is_applied("gradient_checkpointing"));
        assert!(script.inference_mode());
    }

    #[test]
    fn test_graph_rewrite_replaces_model() {
        let (model, script) = model_with(Capabilities {
            graph_rewrite: true,
            ..Capabilities::default()
        });
        let (model, report) = apply_optimizations(model, &all_on());
        assert!(report.is_applied("better_transformer"));
        assert!(script.applied().contains(&"better_transformer".to_string()));
        assert_eq!(model.stats().architecture, "fake (rewritten)");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(OptimizationOutcome::Applied.to_string(), "applied");
        assert_eq!(
            OptimizationOutcome::Failed("boom".into()).to_string(),
            "failed: boom"
        );
    }
}
