//! Type stripping for typed scripts
//!
//! Parses the snippet as TypeScript with oxc, runs the TypeScript transform
//! (annotations, interfaces and declarations removed; enums, namespaces and
//! parameter properties lowered) and prints plain script back out. There is no
//! type checking.

use crate::error::{Result, SandboxError};
use oxc_allocator::Allocator;
use oxc_codegen::CodeGenerator;
use oxc_diagnostics::OxcDiagnostic;
use oxc_parser::{ParseOptions, Parser};
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use std::path::Path;

/// Virtual file name handed to the transformer
const SNIPPET_PATH: &str = "snippet.ts";

fn diagnostics_error(stage: &str, errors: &[OxcDiagnostic]) -> SandboxError {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    SandboxError::execution(format!("TypeScript {} error: {}", stage, messages.join("; ")))
}

/// Strip type syntax from a typed-script snippet body.
///
/// The body may use top-level `return` and `await`, as in every snippet.
/// Parse and transform errors come back as [`SandboxError::Execution`].
pub fn strip_types(source: &str) -> Result<String> {
    let allocator = Allocator::default();
    let options = ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    };
    let parsed = Parser::new(&allocator, source, SourceType::ts())
        .with_options(options)
        .parse();
    if !parsed.errors.is_empty() {
        return Err(diagnostics_error("parse", &parsed.errors));
    }

    let mut program = parsed.program;
    let (symbols, scopes) = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_symbol_table_and_scope_tree();

    let transform_options = TransformOptions::default();
    let transformed = Transformer::new(&allocator, Path::new(SNIPPET_PATH), &transform_options)
        .build_with_symbols_and_scopes(symbols, scopes, &mut program);
    if !transformed.errors.is_empty() {
        return Err(diagnostics_error("transform", &transformed.errors));
    }

    let code = CodeGenerator::new().build(&program).code;
    // The transform keeps a module marker when it drops type-only imports;
    // the snippet runs inside a function body where it is not allowed.
    Ok(code
        .lines()
        .filter(|line| line.trim() != "export {};")
        .collect::<Vec<_>>()
        .join("\n"))
}
