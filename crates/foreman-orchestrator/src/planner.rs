use crate::types::{InputBinding, Plan, Step, StepBinding, StepId, Task};
use foreman_core::text::{overlap_score, slugify, truncate_chars};
use foreman_core::{ForemanError, ForemanResult};
use foreman_llm::{LlmClient, LlmRequest, ToolSpec};
use foreman_memory::MemoryContext;
use foreman_skills::schema::infer_object_schema;
use foreman_skills::{CapabilityDescriptor, CapabilityRegistry, CapabilitySpec};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PLAN_TOOL: &str = "create_plan";

/// Skill name the model uses for a step no listed capability can do.
const UNKNOWN_SKILL: &str = "unknown";

/// Word overlap a description needs to bind to a capability by meaning.
const MIN_MATCH_SCORE: f32 = 0.5;

const NAME_SLUG_WORDS: usize = 4;

const PLANNER_PROMPT: &str = "\
You are the planning component of a task automation system. Break the user's \
task into a short sequence of steps. Each step invokes exactly one capability \
from the catalog below, by its exact name. When no listed capability can do a \
step, use the name \"unknown\" and describe what the step must do; a new \
capability will be written for it and you may list it under skills_to_create.

Parameters are literal JSON values, or {\"$from\": <step index>, \"path\": \
\"<json pointer>\"} to pass along part of an earlier step's output. Steps are \
numbered from 0 and may only depend on earlier steps. Always answer by calling \
the create_plan tool.";

/// Planner limits.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PlannerConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4_096
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    skills_to_create: Vec<String>,
    #[serde(default)]
    estimated_time_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    skill_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Turns a task into a [`Plan`] with the help of the language model.
pub struct Planner {
    llm: LlmClient,
    registry: Arc<CapabilityRegistry>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(llm: LlmClient, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            llm,
            registry,
            config: PlannerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Ask the model for a decomposition of `task` and bind its steps.
    ///
    /// Fails with [`ForemanError::PlanningFailed`] when the model is
    /// unreachable, answers without a plan, or returns a malformed one.
    pub async fn plan(&self, task: &Task, context: &MemoryContext) -> ForemanResult<Plan> {
        let mut request = LlmRequest::new(self.system_prompt(context))
            .user(user_message(task))
            .with_tool(plan_tool());
        request.max_tokens = Some(self.config.max_tokens);

        let response = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| ForemanError::PlanningFailed(format!("language model unavailable: {e}")))?;

        let Some(call) = response.tool_call(PLAN_TOOL) else {
            let reply = truncate_chars(response.content_text().trim(), 300);
            warn!(task = %task.id, "Planner reply carried no plan");
            return Err(ForemanError::PlanningFailed(if reply.is_empty() {
                "model returned no plan".to_string()
            } else {
                format!("model asked for clarification instead of planning: {reply}")
            }));
        };

        let raw: RawPlan = serde_json::from_value(call.arguments.clone())
            .map_err(|e| ForemanError::PlanningFailed(format!("malformed plan: {e}")))?;
        let plan = self.bind(task, raw)?;

        info!(
            task = %task.id,
            plan = %plan.id(),
            steps = plan.len(),
            unbound = plan.unbound_steps().count(),
            "Plan created"
        );
        Ok(plan)
    }

    fn system_prompt(&self, context: &MemoryContext) -> String {
        let mut prompt = PLANNER_PROMPT.to_string();
        if !context.is_empty() {
            prompt.push_str("\n\n# Context\n\n");
            prompt.push_str(&context.render());
        }
        prompt.push_str("\n\n# Capabilities\n\n");
        let catalog = self.registry.catalog();
        if catalog.is_empty() {
            prompt.push_str("(none registered)");
        } else {
            prompt.push_str(&catalog);
        }
        prompt
    }

    fn bind(&self, task: &Task, raw: RawPlan) -> ForemanResult<Plan> {
        if raw.steps.is_empty() {
            return Err(ForemanError::PlanningFailed("plan has no steps".into()));
        }
        let catalog: Vec<CapabilityDescriptor> =
            self.registry.list().into_iter().filter(|d| d.is_valid()).collect();

        let ids: Vec<StepId> = (1..=raw.steps.len()).map(|n| format!("step_{n}")).collect();
        let mut steps = Vec::with_capacity(raw.steps.len());

        for (i, raw_step) in raw.steps.into_iter().enumerate() {
            let params = match raw_step.parameters {
                Value::Null => serde_json::Map::new(),
                Value::Object(map) => map,
                other => {
                    return Err(ForemanError::PlanningFailed(format!(
                        "step {i} parameters must be an object, got {other}"
                    )))
                }
            };

            let mut depends_on: Vec<StepId> = Vec::new();
            for &dep in &raw_step.depends_on {
                if dep >= i {
                    return Err(ForemanError::PlanningFailed(format!(
                        "step {i} depends on step {dep}, which does not come before it"
                    )));
                }
                push_unique(&mut depends_on, &ids[dep]);
            }

            let mut inputs = BTreeMap::new();
            for (name, value) in params {
                let input = parse_input(&value, i, &ids).map_err(|e| {
                    ForemanError::PlanningFailed(format!("step {i} parameter '{name}': {e}"))
                })?;
                if let Some(source) = input.source_step() {
                    push_unique(&mut depends_on, source);
                }
                inputs.insert(name, input);
            }

            let binding = bind_step(
                &raw_step.skill_name,
                &raw_step.description,
                &inputs,
                &catalog,
                &raw.skills_to_create,
            );
            let idempotent = match &binding {
                StepBinding::Bound { name } => catalog
                    .iter()
                    .find(|d| &d.name == name)
                    .is_some_and(|d| d.idempotent),
                StepBinding::Unbound { spec } => spec.idempotent,
            };
            debug!(step = %ids[i], capability = binding.capability_name(), bound = binding.is_bound(), "Bound step");

            steps.push(Step {
                id: ids[i].clone(),
                description: raw_step.description,
                binding,
                depends_on,
                inputs,
                idempotent,
                timeout_secs: raw_step.timeout_seconds,
            });
        }

        Ok(Plan::new(task.id, raw.reasoning, steps)?.with_estimate(raw.estimated_time_seconds))
    }
}

fn push_unique(list: &mut Vec<StepId>, id: &str) {
    if !list.iter().any(|d| d == id) {
        list.push(id.to_string());
    }
}

fn user_message(task: &Task) -> String {
    if task.hints.is_empty() {
        task.goal.clone()
    } else {
        let hints = serde_json::to_string_pretty(&task.hints).unwrap_or_default();
        format!("{}\n\nHints:\n{hints}", task.goal)
    }
}

fn plan_tool() -> ToolSpec {
    ToolSpec {
        name: PLAN_TOOL.to_string(),
        description: "Submit the step-by-step plan for the task.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "reasoning": {"type": "string"},
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "skill_name": {"type": "string"},
                            "description": {"type": "string"},
                            "parameters": {"type": "object"},
                            "depends_on": {"type": "array", "items": {"type": "integer"}},
                            "timeout_seconds": {"type": "integer"}
                        },
                        "required": ["skill_name", "description"]
                    }
                },
                "skills_to_create": {"type": "array", "items": {"type": "string"}},
                "estimated_time_seconds": {"type": "number"}
            },
            "required": ["reasoning", "steps"]
        }),
    }
}

/// A parameter value: a literal, or `{"$from": <index or id>, "path": "/ptr"}`.
fn parse_input(value: &Value, position: usize, ids: &[StepId]) -> Result<InputBinding, String> {
    let Some(source) = value.as_object().and_then(|o| o.get("$from")) else {
        return Ok(InputBinding::Literal {
            value: value.clone(),
        });
    };

    let index = match source {
        Value::Number(n) => n
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format!("invalid step reference {n}"))?,
        Value::String(id) => ids
            .iter()
            .position(|s| s == id)
            .ok_or_else(|| format!("unknown step '{id}'"))?,
        other => return Err(format!("invalid step reference {other}")),
    };
    if index >= position {
        return Err(format!("refers to step {index}, which does not come before it"));
    }

    let pointer = match value.get("path") {
        None | Some(Value::Null) => None,
        Some(Value::String(p)) if p.is_empty() || p.starts_with('/') => {
            (!p.is_empty()).then(|| p.clone())
        }
        Some(other) => return Err(format!("path must be a JSON pointer, got {other}")),
    };

    Ok(InputBinding::StepOutput {
        step: ids[index].clone(),
        pointer,
    })
}

fn bind_step(
    skill_name: &str,
    description: &str,
    inputs: &BTreeMap<String, InputBinding>,
    catalog: &[CapabilityDescriptor],
    skills_to_create: &[String],
) -> StepBinding {
    let named = skill_name.trim();
    if named != UNKNOWN_SKILL {
        if let Some(d) = catalog.iter().find(|d| d.name == named) {
            return StepBinding::Bound {
                name: d.name.clone(),
            };
        }
    }

    if let Some(d) = semantic_match(description, inputs, catalog) {
        return StepBinding::Bound {
            name: d.name.clone(),
        };
    }

    StepBinding::Unbound {
        spec: synthesize_spec(named, description, inputs, skills_to_create),
    }
}

/// Best capability whose required inputs are all supplied and whose name and
/// description share enough words with the step. Ties go to the first name.
fn semantic_match<'a>(
    description: &str,
    inputs: &BTreeMap<String, InputBinding>,
    catalog: &'a [CapabilityDescriptor],
) -> Option<&'a CapabilityDescriptor> {
    let mut best: Option<(&CapabilityDescriptor, f32)> = None;
    for d in catalog {
        if !d.required_inputs().iter().all(|r| inputs.contains_key(r)) {
            continue;
        }
        let score = overlap_score(description, &format!("{} {}", d.name, d.description));
        if score >= MIN_MATCH_SCORE && best.map_or(true, |(_, s)| score > s) {
            best = Some((d, score));
        }
    }
    best.map(|(d, _)| d)
}

fn synthesize_spec(
    skill_name: &str,
    description: &str,
    inputs: &BTreeMap<String, InputBinding>,
    skills_to_create: &[String],
) -> CapabilitySpec {
    let name = if skill_name.is_empty() || skill_name == UNKNOWN_SKILL {
        slugify(description, NAME_SLUG_WORDS)
    } else {
        slugify(skill_name, NAME_SLUG_WORDS)
    };

    let requested = skills_to_create
        .iter()
        .find(|s| slugify(s, NAME_SLUG_WORDS) == name);
    let description = match requested {
        Some(req) if !description.is_empty() => format!("{req}. {description}"),
        Some(req) => req.clone(),
        None => description.to_string(),
    };

    let input_schema = infer_object_schema(inputs.iter().map(|(k, v)| {
        let example = match v {
            InputBinding::Literal { value } => Some(value),
            InputBinding::StepOutput { .. } => None,
        };
        (k.as_str(), example)
    }));

    let all_literal = inputs
        .values()
        .all(|v| matches!(v, InputBinding::Literal { .. }));
    let smoke_input = all_literal.then(|| {
        Value::Object(
            inputs
                .iter()
                .filter_map(|(k, v)| match v {
                    InputBinding::Literal { value } => Some((k.clone(), value.clone())),
                    InputBinding::StepOutput { .. } => None,
                })
                .collect(),
        )
    });

    CapabilitySpec {
        name,
        description,
        input_schema,
        output_schema: json!({"type": "object"}),
        smoke_input,
        idempotent: false,
    }
}
