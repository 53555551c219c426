//! Spec and spec-change validation

use pgha_operator::controller::validation::{validate_spec, validate_spec_change};
use pgha_operator::crd::PostgresCluster;
use serde_json::json;

use crate::common::*;

fn cluster() -> PostgresClusterBuilder {
    PostgresClusterBuilder::ha("pg", "default")
}

fn with_bootstrap(bootstrap: serde_json::Value) -> PostgresCluster {
    cluster()
        .with_spec(json!({
            "bootstrap": bootstrap,
            "externalClusters": [
                { "name": "legacy", "connectionParameters": { "host": "legacy.db" } },
                { "name": "origin", "barmanObjectStore": object_store("s3://backups/origin") },
            ],
        }))
        .build()
}

mod spec_tests {
    use super::*;

    #[test]
    fn test_default_cluster_is_valid() {
        assert!(validate_spec(&cluster().build()).is_ok());
    }

    #[test]
    fn test_instance_bounds() {
        assert!(validate_spec(&cluster().with_instances(0).build()).is_err());
        assert!(validate_spec(&cluster().with_instances(100).build()).is_ok());
        assert!(validate_spec(&cluster().with_instances(101).build()).is_err());
    }

    #[test]
    fn test_storage_size_must_parse_and_be_positive() {
        assert!(validate_spec(&cluster().with_storage("0", None).build()).is_err());
        assert!(validate_spec(&cluster().with_storage("lots", None).build()).is_err());
        assert!(validate_spec(&cluster().with_wal_storage("bad").build()).is_err());
    }

    #[test]
    fn test_auto_resize_configuration() {
        let ok = cluster()
            .with_auto_resize(json!({ "expansion": { "step": "5Gi", "limit": "100Gi" } }))
            .build();
        assert!(validate_spec(&ok).is_ok());

        let threshold = cluster()
            .with_auto_resize(json!({ "triggers": { "usageThreshold": 100 } }))
            .build();
        assert!(validate_spec(&threshold).is_err());

        let bare_step = cluster()
            .with_auto_resize(json!({ "expansion": { "step": "20" } }))
            .build();
        assert!(validate_spec(&bare_step).is_err());

        let inverted = cluster()
            .with_auto_resize(json!({ "expansion": { "minStep": "10Gi", "maxStep": "1Gi" } }))
            .build();
        assert!(validate_spec(&inverted).is_err());

        let small_limit = cluster()
            .with_auto_resize(json!({ "expansion": { "limit": "5Gi" } }))
            .build();
        assert!(validate_spec(&small_limit).is_err());
    }

    #[test]
    fn test_backup_destination_must_be_s3() {
        assert!(validate_spec(&cluster().with_backup("s3://bucket/path").build()).is_ok());
        assert!(validate_spec(&cluster().with_backup("gs://bucket/path").build()).is_err());
        assert!(validate_spec(&cluster().with_backup("s3://").build()).is_err());
    }

    #[test]
    fn test_malformed_fence_annotation() {
        assert!(validate_spec(&cluster().with_fenced(r#"["pg-1"]"#).build()).is_ok());
        assert!(validate_spec(&cluster().with_fenced("pg-1").build()).is_err());
    }
}

mod bootstrap_tests {
    use super::*;

    #[test]
    fn test_exactly_one_method() {
        assert!(validate_spec(&with_bootstrap(json!({ "initdb": {} }))).is_ok());
        assert!(validate_spec(&with_bootstrap(json!({}))).is_err());
        assert!(validate_spec(&with_bootstrap(json!({
            "initdb": {},
            "recovery": { "source": "origin" },
        })))
        .is_err());
    }

    #[test]
    fn test_microservice_import() {
        let import = |databases: serde_json::Value, roles: serde_json::Value| {
            with_bootstrap(json!({
                "initdb": {
                    "import": {
                        "type": "microservice",
                        "databases": databases,
                        "roles": roles,
                        "source": { "externalCluster": "legacy" },
                    }
                }
            }))
        };
        assert!(validate_spec(&import(json!(["app"]), json!([]))).is_ok());
        assert!(validate_spec(&import(json!(["a", "b"]), json!([]))).is_err());
        assert!(validate_spec(&import(json!(["app"]), json!(["owner"]))).is_err());
        assert!(validate_spec(&import(json!(["*"]), json!([]))).is_err());
    }

    #[test]
    fn test_monolith_import() {
        let import = |databases: serde_json::Value, source: &str| {
            with_bootstrap(json!({
                "initdb": {
                    "import": {
                        "type": "monolith",
                        "databases": databases,
                        "roles": ["*"],
                        "source": { "externalCluster": source },
                    }
                }
            }))
        };
        assert!(validate_spec(&import(json!(["*"]), "legacy")).is_ok());
        assert!(validate_spec(&import(json!([]), "legacy")).is_err());
        assert!(validate_spec(&import(json!(["*"]), "missing")).is_err());
    }

    #[test]
    fn test_recovery_sources() {
        let ok = with_bootstrap(json!({
            "recovery": {
                "source": "origin",
                "recoveryTarget": { "targetTime": "2026-01-01T10:00:00Z" },
            }
        }));
        assert!(validate_spec(&ok).is_ok());

        let from_backup = with_bootstrap(json!({ "recovery": { "backup": { "name": "nightly" } } }));
        assert!(validate_spec(&from_backup).is_ok());

        let both = with_bootstrap(json!({
            "recovery": { "backup": { "name": "nightly" }, "source": "origin" }
        }));
        assert!(validate_spec(&both).is_err());

        let neither = with_bootstrap(json!({ "recovery": {} }));
        assert!(validate_spec(&neither).is_err());

        // legacy has no object store
        let no_store = with_bootstrap(json!({ "recovery": { "source": "legacy" } }));
        assert!(validate_spec(&no_store).is_err());

        let bad_time = with_bootstrap(json!({
            "recovery": { "source": "origin", "recoveryTarget": { "targetTime": "yesterday" } }
        }));
        assert!(validate_spec(&bad_time).is_err());
    }
}

mod change_tests {
    use super::*;

    #[test]
    fn test_scale_and_image_diff() {
        let old = cluster().build();
        let new = cluster()
            .with_instances(5)
            .with_image("ghcr.io/cloudnative-pg/postgresql:17")
            .build();
        let diff = validate_spec_change(&old, &new).unwrap();
        assert!(diff.instances_changed);
        assert_eq!(diff.instance_delta, 2);
        assert!(diff.image_changed);
        assert!(diff.requires_rolling_update());
    }

    #[test]
    fn test_volumes_only_grow() {
        let old = cluster().with_wal_storage("5Gi").build();
        let grown = cluster().with_storage("20Gi", None).with_wal_storage("5Gi").build();
        assert!(validate_spec_change(&old, &grown).unwrap().storage_grown);

        let shrunk = cluster().with_storage("5Gi", None).with_wal_storage("5Gi").build();
        assert!(validate_spec_change(&old, &shrunk).is_err());

        let wal_shrunk = cluster().with_wal_storage("1Gi").build();
        assert!(validate_spec_change(&old, &wal_shrunk).is_err());
    }

    #[test]
    fn test_immutable_fields() {
        let old = cluster().with_storage("10Gi", Some("fast")).build();
        let new = cluster().with_storage("10Gi", Some("slow")).build();
        assert!(validate_spec_change(&old, &new).is_err());

        let base = cluster().build();
        assert!(validate_spec_change(&base, &cluster().with_wal_storage("5Gi").build()).is_err());

        let bootstrapped = with_bootstrap(json!({ "initdb": {} }));
        assert!(validate_spec_change(&base, &bootstrapped).is_err());
    }

    #[test]
    fn test_unchanged_spec() {
        let diff = validate_spec_change(&cluster().build(), &cluster().build()).unwrap();
        assert!(!diff.has_changes());
    }
}
