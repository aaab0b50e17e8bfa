#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Tests for controller-method launchers
//!
//! - Arguments are resolved from path, query, header and body before the
//!   method runs, and the method may suspend like any launched body
//! - Resolution and provider failures surface as 400 responses through the
//!   same error path as method failures; the method is never invoked
//! - Task names are `Controller::method`

mod common;

use common::{respond, started_router, HookLog};
use corouter::error::ResolutionFailure;
use corouter::launcher::{
    ArgumentResolver, Args, MethodDescriptor, ParamKind, ParamSpec, Singleton,
};
use corouter::{
    ArgumentResolutionError, Context, Reply, Request, Route, StartPolicy, Suspend,
};
use http::Method;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct PetController {
    calls: AtomicUsize,
}

impl PetController {
    fn get_pet(&self, args: Args, suspend: &Suspend) -> anyhow::Result<Reply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        suspend.delay(Duration::from_millis(10))?;
        Ok(json!({
            "id": args.i64(0),
            "verbose": args.bool(1),
            "task": suspend.task_name(),
        })
        .into())
    }
}

fn get_pet_method() -> MethodDescriptor {
    MethodDescriptor::new("PetController", "get_pet")
        .param(ParamSpec::path("id", ParamKind::Integer))
        .param(ParamSpec::query("verbose", ParamKind::Boolean).default_value(json!(false)))
}

fn pet_router(controller: Arc<PetController>, log: &HookLog) -> corouter::Router {
    let mut router = started_router(StartPolicy::Eager);
    let provided = controller.clone();
    let launcher = router.mvc(
        move |_: &Context| -> anyhow::Result<Arc<PetController>> { Ok(provided.clone()) },
        get_pet_method(),
        |c: &PetController, args, _ctx, suspend| c.get_pet(args, suspend),
    );
    router.add_route(
        Route::builder(Method::GET, "/pets/{id}")
            .handler(launcher)
            .after(log.hook())
            .build(),
    );
    router
}

#[test]
fn test_resolves_arguments_and_suspends() {
    let controller = Arc::new(PetController::default());
    let log = HookLog::default();
    let router = pet_router(controller.clone(), &log);

    let (_ctx, res) = respond(&router, Request::get("/pets/42?verbose=true"));
    assert_eq!(res.status, 200);
    assert_eq!(
        res.body,
        json!({"id": 42, "verbose": true, "task": "PetController::get_pet"})
    );
    assert_eq!(controller.calls.load(Ordering::SeqCst), 1);
    assert_eq!(log.single().value, Some(res.body.clone()));
}

#[test]
fn test_malformed_parameter_never_invokes_method() {
    let controller = Arc::new(PetController::default());
    let log = HookLog::default();
    let router = pet_router(controller.clone(), &log);

    let (_ctx, res) = respond(&router, Request::get("/pets/abc"));
    assert_eq!(res.status, 400);
    assert_eq!(res.body["kind"], "argument_resolution");
    assert!(res.body["error"].as_str().unwrap().contains("`id`"));
    assert_eq!(controller.calls.load(Ordering::SeqCst), 0);

    let event = log.single();
    assert_eq!(event.error_kind, Some("argument_resolution"));
    assert!(event.value.is_none());
}

#[test]
fn test_percent_encoded_arguments_resolve() {
    let controller = Arc::new(PetController::default());
    let log = HookLog::default();
    let router = pet_router(controller.clone(), &log);

    let (_ctx, res) = respond(&router, Request::get("/pets/4%32?verbose=tru%65"));
    assert_eq!(res.status, 200);
    assert_eq!(res.body["id"], 42);
    assert_eq!(res.body["verbose"], true);
    assert_eq!(controller.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_malformed_query_parameter() {
    let controller = Arc::new(PetController::default());
    let log = HookLog::default();
    let router = pet_router(controller.clone(), &log);

    let (_ctx, res) = respond(&router, Request::get("/pets/1?verbose=maybe"));
    assert_eq!(res.status, 400);
    assert_eq!(controller.calls.load(Ordering::SeqCst), 0);
    assert_eq!(log.single().error_kind, Some("argument_resolution"));
}

#[test]
fn test_provider_failure_is_a_resolution_failure() {
    let mut router = started_router(StartPolicy::Eager);
    let launcher = router.mvc(
        |_: &Context| -> anyhow::Result<Arc<PetController>> {
            anyhow::bail!("pool exhausted")
        },
        get_pet_method(),
        |c: &PetController, args, _ctx, suspend| c.get_pet(args, suspend),
    );
    router.get("/pets/{id}", launcher);

    let (_ctx, res) = respond(&router, Request::get("/pets/1"));
    assert_eq!(res.status, 400);
    assert!(res.body["error"].as_str().unwrap().contains("pool exhausted"));
}

#[test]
fn test_method_failure_uses_same_error_path() {
    let mut router = started_router(StartPolicy::Eager);
    let launcher = router.mvc(
        Singleton::new(PetController::default()),
        MethodDescriptor::new("PetController", "delete_pet"),
        |_c: &PetController, _args, _ctx, suspend| {
            suspend.delay(Duration::from_millis(5))?;
            anyhow::bail!("read-only store")
        },
    );
    router.delete("/pets/{id}", launcher);

    let req = Request::new(Method::DELETE, "/pets/1");
    let (_ctx, res) = respond(&router, req);
    assert_eq!(res.status, 500);
    assert_eq!(res.body["kind"], "handler_execution");
}

struct TenantResolver;

impl ArgumentResolver for TenantResolver {
    fn resolve(
        &self,
        ctx: &Context,
        method: &MethodDescriptor,
    ) -> Result<Args, ArgumentResolutionError> {
        let tenant = ctx
            .request()
            .get_header("x-tenant")
            .ok_or_else(|| ArgumentResolutionError::missing(&method.qualified_name(), "tenant"))?;
        Ok(Args::new(vec![json!(tenant)]))
    }
}

#[test]
fn test_custom_resolver() {
    let mut router = started_router(StartPolicy::Eager);
    let launcher = router
        .mvc(
            Singleton::new(()),
            MethodDescriptor::new("TenantController", "whoami"),
            |_: &(), args, _ctx, _suspend| Ok(Reply::text(args.str(0).unwrap_or_default())),
        )
        .resolver(TenantResolver);
    assert_eq!(launcher.method().qualified_name(), "TenantController::whoami");
    router.get("/whoami", launcher);

    let (_ctx, res) = respond(&router, Request::get("/whoami").header("X-Tenant", "acme"));
    assert_eq!(res.body_text(), Some("acme"));

    let (_ctx, res) = respond(&router, Request::get("/whoami"));
    assert_eq!(res.status, 400);
}

#[test]
fn test_body_parameters() {
    let mut router = started_router(StartPolicy::Lazy);
    let launcher = router.mvc(
        Singleton::new(()),
        MethodDescriptor::new("PetController", "create")
            .param(ParamSpec::body("name", ParamKind::String))
            .param(ParamSpec::body("tags", ParamKind::Json).optional()),
        |_: &(), args, ctx, _suspend| {
            ctx.set_status(201);
            Ok(json!({"name": args.str(0), "tags": args.get(1)}).into())
        },
    );
    router.post("/pets", launcher);

    let req = Request::post("/pets").json(json!({"name": "Rex", "tags": ["good"]}));
    let (_ctx, res) = respond(&router, req);
    assert_eq!(res.status, 201);
    assert_eq!(res.body, json!({"name": "Rex", "tags": ["good"]}));

    let (_ctx, res) = respond(&router, Request::post("/pets").json(json!({"tags": []})));
    assert_eq!(res.status, 400);
}

#[test]
fn test_resolution_error_details() {
    let err = ArgumentResolutionError::mismatch("PetController::get_pet", "id", "integer", "abc");
    assert_eq!(
        err.failure,
        ResolutionFailure::TypeMismatch {
            expected: "integer",
            found: "abc".to_string()
        }
    );
    assert!(err.to_string().contains("PetController::get_pet"));
}
