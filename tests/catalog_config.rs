//! Catalog loading and registry behavior from external configuration

use std::io::Write;

use kiln::config::{self, Catalog, KernelRegistry};
use kiln::rules::SelectionCtx;
use kiln::KernelError;

#[test]
fn catalog_round_trips_through_a_file() {
    let text = r#"
[operations.attention.variants.decode_streaming]
shader_source = "attention_decode"
entry_point = "decode_streaming"
workgroup = [64, 1, 1]
bindings = [
    { index = 0, kind = "uniform" },
    { index = 1, kind = "read_storage" },
    { index = 2, kind = "read_write_storage" },
]
uniforms = [{ name = "seq_len", offset = 0, ty = "u32" }]
output_dtype = "f32"

[thresholds.matmul]
multicol_threshold = 2048

[[rules.attention.decode]]
value = "decode_streaming"
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    let loaded = std::fs::read_to_string(file.path()).unwrap();

    let catalog = Catalog::parse(&loaded).unwrap();
    assert_eq!(catalog.thresholds.matmul.multicol_threshold, 2048);
    // Unlisted threshold groups keep their defaults.
    assert_eq!(catalog.thresholds.attention.large_max_head_dim, 128);

    let registry = KernelRegistry::from_catalog(&catalog).unwrap();
    let config = registry.lookup("attention", "decode_streaming").unwrap();
    assert_eq!(config.entry_point, "decode_streaming");
    assert_eq!(config.uniforms_size(), 4);

    let rules = catalog.build_rules();
    assert_eq!(
        rules.select("attention", "decode", &SelectionCtx::new()),
        Some("decode_streaming")
    );
}

#[test]
fn malformed_catalog_is_a_config_error() {
    let err = Catalog::parse("operations = 3").unwrap_err();
    assert!(matches!(err, KernelError::Config { .. }));

    let text = r#"
[operations.matmul.variants.bad]
shader_source = "m"
entry_point = "main"
workgroup = [64, 1, 1]
bindings = [
    { index = 0, kind = "uniform" },
    { index = 0, kind = "read_storage" },
]
"#;
    let catalog = Catalog::parse(text).unwrap();
    let err = KernelRegistry::from_catalog(&catalog).unwrap_err();
    assert!(err.to_string().contains("binding index 0 declared twice"));
}

#[test]
fn zero_workgroup_axis_is_rejected_at_load() {
    let text = r#"
[operations.matmul.variants.bad]
shader_source = "m"
entry_point = "main"
workgroup = [64, 0, 1]
"#;
    let catalog = Catalog::parse(text).unwrap();
    assert!(KernelRegistry::from_catalog(&catalog).is_err());
}

#[test]
fn builtin_catalog_covers_the_operator_surface() {
    let catalog = config::builtin_catalog().unwrap();
    let registry = KernelRegistry::from_catalog(&catalog).unwrap();

    for op in [
        "attention",
        "matmul",
        "fused_ffn",
        "fused_matmul_rmsnorm",
        "rmsnorm",
        "layernorm",
        "groupnorm",
        "softmax",
        "rope",
        "silu",
        "gelu",
        "gather",
        "residual",
        "scatter_add",
        "moe_gather",
        "sample",
        "check_stop",
        "conv2d",
        "upsample2d",
        "bias_add",
        "scale",
        "clamp",
        "cast",
    ] {
        assert!(
            !registry.variant_names(op).is_empty(),
            "operation '{}' missing from the builtin catalog",
            op
        );
    }
}

#[test]
fn registry_rebuild_yields_identical_configs() {
    // Rebuilding from the same catalog (the clear-caches path) must give
    // byte-identical variant contracts.
    let catalog = config::builtin_catalog().unwrap();
    let a = KernelRegistry::from_catalog(&catalog).unwrap();
    let b = KernelRegistry::from_catalog(&catalog).unwrap();

    for op in a.operation_names() {
        assert_eq!(a.variant_names(&op), b.variant_names(&op));
        for variant in a.variant_names(&op) {
            let ca = a.lookup(&op, &variant).unwrap();
            let cb = b.lookup(&op, &variant).unwrap();
            assert_eq!(ca.entry_point, cb.entry_point);
            assert_eq!(ca.workgroup, cb.workgroup);
            assert_eq!(ca.uniforms_size(), cb.uniforms_size());
        }
    }
}
