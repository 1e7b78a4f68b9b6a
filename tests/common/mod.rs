use forge_hdr::model::{Resource, ResourceRef};

/// A minimal but fully-compliant resource fixture, mirroring the shape
/// every built-in compliance policy expects, so tests that aren't
/// exercising a specific policy don't trip unrelated ones.
pub fn make_test_resource(name: &str) -> Resource {
    let mut r = Resource::new(ResourceRef::new("Pod", "default", name));
    r.cpu_request_millis = Some(100);
    r.cpu_limit_millis = Some(500);
    r.memory_request_gib = Some(0.125);
    r.memory_limit_gib = Some(0.25);
    r.image = Some("gcr.io/example/app:1.0.0".to_string());
    r.replicas = Some(2);
    r.has_liveness_probe = true;
    r.has_readiness_probe = true;
    r.run_as_non_root = Some(true);
    r.read_only_root_filesystem = Some(true);
    r.network_policy_attached = true;
    r
}
