use crate::capability::CapabilitySpec;
use crate::schema;
use crate::script::{ScriptRuntime, DISALLOWED_SYMBOLS, ENTRY_POINT, LLM_FUNCTION};
use regex::Regex;
use rhai::AST;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Largest script source accepted from the model.
pub const MAX_SOURCE_BYTES: usize = 64 * 1024;

/// Where in the pipeline a candidate script was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    Extract,
    Static,
    Compile,
    Signature,
    Smoke,
    OutputSchema,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationStage::Extract => "extract",
            ValidationStage::Static => "static",
            ValidationStage::Compile => "compile",
            ValidationStage::Signature => "signature",
            ValidationStage::Smoke => "smoke",
            ValidationStage::OutputSchema => "output_schema",
        };
        f.write_str(name)
    }
}

/// A rejected candidate, with the stage it failed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub stage: ValidationStage,
    pub message: String,
}

impl ValidationError {
    pub fn new(stage: ValidationStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.message)
    }
}

fn disallowed_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(&format!(r"\b({})\b", DISALLOWED_SYMBOLS.join("|"))).ok())
        .as_ref()
}

fn llm_call_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(&format!(r"\b{LLM_FUNCTION}\s*\(")).ok())
        .as_ref()
}

/// `source` with the contents of string and character literals and all
/// comments blanked out. Line breaks are kept.
pub fn strip_literals(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' | '`' => {
                out.push(c);
                let mut escaped = false;
                for inner in chars.by_ref() {
                    if !escaped && inner == c {
                        out.push(c);
                        break;
                    }
                    escaped = !escaped && inner == '\\' && c != '`';
                    out.push(if inner == '\n' { '\n' } else { ' ' });
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    if inner == '\n' {
                        out.push('\n');
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Whether the script calls the model through `llm_complete`.
pub fn uses_llm(source: &str) -> bool {
    llm_call_pattern().is_some_and(|re| re.is_match(&strip_literals(source)))
}

/// Checks candidate scripts before they are admitted to the registry.
#[derive(Debug, Clone)]
pub struct ScriptValidator {
    runtime: Arc<ScriptRuntime>,
}

impl ScriptValidator {
    pub fn new(runtime: Arc<ScriptRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<ScriptRuntime> {
        &self.runtime
    }

    /// Source-level checks: size and disallowed symbols.
    pub fn check_static(&self, source: &str) -> Result<(), ValidationError> {
        if source.trim().is_empty() {
            return Err(ValidationError::new(ValidationStage::Static, "script is empty"));
        }
        if source.len() > MAX_SOURCE_BYTES {
            return Err(ValidationError::new(
                ValidationStage::Static,
                format!("script is {} bytes, limit is {MAX_SOURCE_BYTES}", source.len()),
            ));
        }
        // Also rejected by the engine at compile time.
        let code = strip_literals(source);
        if let Some(m) = disallowed_pattern().and_then(|re| re.find(&code)) {
            return Err(ValidationError::new(
                ValidationStage::Static,
                format!("use of disallowed symbol '{}'", m.as_str()),
            ));
        }
        Ok(())
    }

    /// Compile in isolation and require exactly one `run(input)` entry point.
    pub fn compile_checked(&self, source: &str) -> Result<AST, ValidationError> {
        self.check_static(source)?;
        let ast = self
            .runtime
            .compile(source)
            .map_err(|e| ValidationError::new(ValidationStage::Compile, e))?;

        let entry_points: Vec<usize> = ast
            .iter_functions()
            .filter(|f| f.name == ENTRY_POINT)
            .map(|f| f.params.len())
            .collect();
        match entry_points.as_slice() {
            [1] => Ok(ast),
            [] => Err(ValidationError::new(
                ValidationStage::Signature,
                format!("script must define `fn {ENTRY_POINT}(input)`"),
            )),
            _ => Err(ValidationError::new(
                ValidationStage::Signature,
                format!("`{ENTRY_POINT}` must take exactly one parameter"),
            )),
        }
    }

    /// Full admission check: static, compile, signature, then a smoke run when
    /// an input is known, whose result must match the output schema. Scripts
    /// that call the model get it during the smoke run, so this blocks and
    /// must run off the async runtime.
    pub fn validate(&self, source: &str, spec: &CapabilitySpec) -> Result<AST, ValidationError> {
        let ast = self.compile_checked(source)?;

        let smoke_input = spec
            .smoke_input
            .clone()
            .or_else(|| schema::synthesize_input(&spec.input_schema));
        if let Some(input) = smoke_input {
            let result = if uses_llm(source) {
                self.runtime.call_run_with_llm(&ast, &input)
            } else {
                self.runtime.call_run(&ast, &input)
            };
            let output = result
                .map_err(|f| ValidationError::new(ValidationStage::Smoke, f.to_string()))?;
            schema::validate(&output, &spec.output_schema)
                .map_err(|e| ValidationError::new(ValidationStage::OutputSchema, e))?;
        }

        Ok(ast)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> ScriptValidator {
        ScriptValidator::new(Arc::new(ScriptRuntime::default()))
    }

    fn spec(smoke: Option<serde_json::Value>) -> CapabilitySpec {
        CapabilitySpec {
            name: "double".into(),
            description: "Double a number".into(),
            input_schema: json!({"type": "object", "required": ["n"]}),
            output_schema: json!({
                "type": "object",
                "properties": {"value": {"type": "integer"}},
                "required": ["value"]
            }),
            smoke_input: smoke,
            idempotent: true,
        }
    }

    #[test]
    fn test_valid_script_passes() {
        let src = "fn run(input) { #{ value: input.n * 2 } }";
        assert!(validator().validate(src, &spec(Some(json!({"n": 2})))).is_ok());
    }

    #[test]
    fn test_static_rejects_disallowed_symbol() {
        let err = validator()
            .validate(r#"fn run(input) { eval("1") }"#, &spec(None))
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::Static);
        assert!(err.message.contains("eval"));
    }

    #[test]
    fn test_identifier_containing_symbol_is_allowed() {
        let src = "fn run(input) { let evaluation = 1; #{ value: evaluation } }";
        assert!(validator().compile_checked(src).is_ok());
    }

    #[test]
    fn test_symbols_inside_literals_and_comments_are_allowed() {
        let src = r#"
            // never eval anything
            fn run(input) {
                /* import nothing */
                #{ value: 1, note: "do not eval or import \"export\"", c: 'e' }
            }
        "#;
        assert!(validator().check_static(src).is_ok());
        assert!(validator().compile_checked(src).is_ok());
        assert!(validator().check_static(r#"fn run(input) { let s = "x"; eval(s) }"#).is_err());
    }

    #[test]
    fn test_strip_literals_keeps_code() {
        let stripped = strip_literals("let a = \"b\\\"c\"; // d\nlet e = `f`;");
        assert_eq!(stripped, "let a = \"    \"; \nlet e = ` `;");
        assert!(uses_llm(r#"fn run(i) { llm_complete ("hi") }"#));
        assert!(!uses_llm(r#"fn run(i) { "llm_complete(x)" }"#));
    }

    #[test]
    fn test_compile_error() {
        let err = validator()
            .validate("fn run(input) { let = ; }", &spec(None))
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::Compile);
    }

    #[test]
    fn test_signature_checks() {
        let err = validator()
            .validate("fn main(input) { 1 }", &spec(None))
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::Signature);

        let err = validator()
            .validate("fn run(a, b) { 1 }", &spec(None))
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::Signature);
    }

    #[test]
    fn test_smoke_and_output_schema() {
        let err = validator()
            .validate(
                r#"fn run(input) { throw "nope"; }"#,
                &spec(Some(json!({"n": 1}))),
            )
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::Smoke);

        let err = validator()
            .validate(
                r#"fn run(input) { #{ value: "two" } }"#,
                &spec(Some(json!({"n": 1}))),
            )
            .unwrap_err();
        assert_eq!(err.stage, ValidationStage::OutputSchema);
    }

    #[test]
    fn test_no_smoke_without_input() {
        // Required input and no smoke input: only static checks apply.
        let src = r#"fn run(input) { throw "only fails at runtime"; }"#;
        assert!(validator().validate(src, &spec(None)).is_ok());
    }
}
