use thiserror::Error;

/// Failures that abort the whole run instead of skipping one class.
#[derive(Debug, Error)]
pub(crate) enum WeaveError {
    #[error(
        "dangling pointcut: {class}.{method} (prefix {prefix}) declared by advice {aspect}.{advice}"
    )]
    DanglingPointcut {
        class: String,
        method: String,
        prefix: String,
        aspect: String,
        advice: String,
    },
    #[error("cannot bridge {owner}.{name}{descriptor} in {class}: invokespecial method handle")]
    UnsupportedBridgeHandle {
        class: String,
        owner: String,
        name: String,
        descriptor: String,
    },
}

/// Whether `error` carries a [`WeaveError`] anywhere in its context chain.
pub(crate) fn is_fatal(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<WeaveError>().is_some())
}
