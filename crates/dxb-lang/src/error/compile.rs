use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("DATEX Script to big to compile")]
    ScriptTooBig,
    #[error("Invalid variable id: {0} (too big)")]
    InvalidVariableId(u32),
    #[error("Pointer ID size must not exceed 26 bytes")]
    PointerIdTooLarge,
    #[error("Cannot redeclare {kind} '{name}'")]
    Redeclared { kind: &'static str, name: SmolStr },
    #[error("Variable '{0}' was not declared in scope")]
    UndeclaredVariable(SmolStr),
    #[error("Cannot change the reference of a reference variable '{0}'")]
    ReferenceOverride(SmolStr),
    #[error("Cannot assign a new value to the value variable '{0}'")]
    ValueReferenceOverride(SmolStr),
    #[error("The value variables '{0}' borrowed from the parent scope is readonly")]
    BorrowedReadonly(SmolStr),
    #[error("Cannot assign a new value to the constant '{0}'")]
    ConstReadonly(SmolStr),
    #[error("Cannot access variable '{0}' outside of a child scope block")]
    ExtractOutsideChildScope(SmolStr),
    #[error("Invalid variable base type for '{0}'")]
    InvalidVariableBaseType(SmolStr),
    #[error("Invalid action on internal variable #{0}")]
    InvalidInternalVarAction(SmolStr),
    #[error("Internal variable #{0} does not exist in this context")]
    UnknownInternalVar(SmolStr),
    #[error("Cannot export undeclared variable '{0}'")]
    ExportUndeclared(SmolStr),
    #[error("Function variable '{0}' was already declared")]
    FunctionParamRedeclared(SmolStr),
    #[error("Plugin \"{0}\" is required, but not found in script")]
    MissingPlugin(String),
    #[error("Plugins \"{0}\" are required, but not found in script")]
    MissingPlugins(String),
    #[error("Name '{0}' is longer than 255 bytes")]
    NameTooLong(SmolStr),
    #[error("Integer magnitude exceeds 65535 bytes")]
    BigIntTooLarge,
    #[error("Unsupported command: {0}")]
    Unsupported(String),
    #[error("Compile-time evaluation failed: {0}")]
    Evaluation(String),
    #[error("Iteration limit of {0} exceeded")]
    IterationLimit(usize),
}
