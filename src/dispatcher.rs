//! Request/response protocol for hosting the engine in a worker.
//!
//! The host addresses engine objects by ids it picks itself. A request
//! either creates an object, disposes one, reads a property, calls a method
//! or calls a factory whose result is registered under a new id. Every
//! request gets exactly one [`Response`] echoing its call id; failures are
//! reported in the response and leave the object table untouched.
//! Progress and fatal load problems are pushed as [`Event`]s.

use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error as _;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregates::NodeFilter;
use crate::diff::AggregateForDiff;
use crate::loader::{LoadError, Loader, Progress, RawSnapshot, percent};
use crate::policy::{GenericPolicy, JsHeapPolicy, PolicyConfig, SnapshotPolicy};
use crate::provider::{ComparatorConfig, ItemProvider};
use crate::search::SearchConfig;
use crate::snapshot::{HeapSnapshot, SnapshotError};

pub type ObjectId = u64;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no object with id {0}")]
    UnknownObject(ObjectId),

    #[error("{object_type} has no member \"{member}\"")]
    UnknownMethod {
        object_type: &'static str,
        member: String,
    },

    #[error("unknown object type \"{0}\"")]
    UnknownObjectType(String),

    #[error("request is missing \"{0}\"")]
    MissingField(&'static str),

    #[error("bad arguments: {0}")]
    BadArguments(#[source] serde_json::Error),

    #[error("could not encode result: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("load error: {0}")]
    Load(#[from] LoadError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    Create,
    Dispose,
    Getter,
    Factory,
    Method,
    EvaluateForTest,
}

/// One host request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation id echoed in the response.
    pub call_id: u64,
    pub disposition: Disposition,
    #[serde(default)]
    pub object_id: Option<ObjectId>,
    /// Type to instantiate for `create`.
    #[serde(default)]
    pub object_type: Option<String>,
    /// Method or property name.
    #[serde(default)]
    pub method_name: Option<String>,
    #[serde(default)]
    pub method_arguments: Vec<Value>,
    /// Id to register a factory's product under.
    #[serde(default)]
    pub new_object_id: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub call_id: u64,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Source chain of the error, outermost first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_call_stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_method_name: Option<String>,
}

impl Response {
    fn ok(call_id: u64, result: Value) -> Self {
        Response {
            call_id,
            result,
            error: None,
            error_call_stack: None,
            error_method_name: None,
        }
    }

    fn failed(call_id: u64, err: &DispatchError, method_name: Option<String>) -> Self {
        let mut stack = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }
        Response {
            call_id,
            result: Value::Null,
            error: Some(err.to_string()),
            error_call_stack: Some(stack.join("\n")),
            error_method_name: method_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventName {
    ProgressUpdate,
    BrokenSnapshot,
}

/// Unsolicited notification to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_name: EventName,
    pub data: Value,
}

type EventQueue = Rc<RefCell<Vec<Event>>>;

/// Turns loader and analysis progress into events.
struct EventProgress {
    events: EventQueue,
}

impl EventProgress {
    fn push(&self, event_name: EventName, data: Value) {
        self.events.borrow_mut().push(Event { event_name, data });
    }
}

impl Progress for EventProgress {
    fn update_status(&self, status: &str) {
        debug!("{}", status);
        self.push(EventName::ProgressUpdate, serde_json::json!({ "text": status }));
    }

    fn update_progress(&self, title: &str, value: usize, total: usize) {
        self.push(
            EventName::ProgressUpdate,
            serde_json::json!({
                "text": title,
                "percent": percent(value, total),
            }),
        );
    }

    fn report_problem(&self, message: &str) {
        warn!("{}", message);
        self.push(EventName::BrokenSnapshot, Value::String(message.to_string()));
    }
}

// ============================================================================
// Engine objects
// ============================================================================

/// Something the host can hold an id for.
pub trait EngineObject {
    fn object_type(&self) -> &'static str;

    fn get(&self, property: &str) -> Result<Value> {
        Err(self.unknown(property))
    }

    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        let _ = args;
        Err(self.unknown(method))
    }

    fn create(&mut self, method: &str, args: &[Value]) -> Result<Box<dyn EngineObject>> {
        let _ = args;
        Err(self.unknown(method))
    }

    fn unknown(&self, member: &str) -> DispatchError {
        DispatchError::UnknownMethod {
            object_type: self.object_type(),
            member: member.to_string(),
        }
    }
}

fn arg<T: DeserializeOwned>(args: &[Value], position: usize) -> Result<T> {
    let value = args.get(position).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(DispatchError::BadArguments)
}

fn encode<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(DispatchError::Encode)
}

/// Options for `buildSnapshot`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BuildOptions {
    generic: bool,
    policy: Option<PolicyConfig>,
}

impl BuildOptions {
    fn policy(self) -> Box<dyn SnapshotPolicy> {
        if self.generic {
            Box::new(GenericPolicy)
        } else {
            Box::new(JsHeapPolicy::new(self.policy.unwrap_or_default()))
        }
    }
}

struct LoaderObject {
    loader: Loader,
    raw: Option<RawSnapshot>,
    events: EventQueue,
}

impl EngineObject for LoaderObject {
    fn object_type(&self) -> &'static str {
        "HeapSnapshotLoader"
    }

    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "write" => {
                let chunk: String = arg(args, 0)?;
                self.loader.write(chunk.as_bytes())?;
                Ok(Value::Null)
            }
            "close" => {
                self.raw = Some(self.loader.close()?);
                Ok(Value::Null)
            }
            _ => Err(self.unknown(method)),
        }
    }

    fn create(&mut self, method: &str, args: &[Value]) -> Result<Box<dyn EngineObject>> {
        if method != "buildSnapshot" {
            return Err(self.unknown(method));
        }
        let options: Option<BuildOptions> = arg(args, 0)?;
        let raw = match self.raw.take() {
            Some(raw) => raw,
            None => self.loader.close()?,
        };
        let progress = EventProgress {
            events: Rc::clone(&self.events),
        };
        let snapshot =
            HeapSnapshot::with_progress(raw, options.unwrap_or_default().policy(), &progress)?;
        for report in snapshot.problem_reports() {
            warn!("{}", report);
        }
        Ok(Box::new(SnapshotObject {
            snapshot: Rc::new(snapshot),
        }))
    }
}

struct SnapshotObject {
    snapshot: Rc<HeapSnapshot>,
}

impl EngineObject for SnapshotObject {
    fn object_type(&self) -> &'static str {
        "HeapSnapshot"
    }

    fn get(&self, property: &str) -> Result<Value> {
        let snapshot = self.snapshot.as_ref();
        match property {
            "uid" => encode(snapshot.header().uid),
            "title" => encode(&snapshot.header().title),
            "nodeCount" => encode(snapshot.node_count()),
            "rootNodeIndex" => encode(snapshot.graph().root_index()),
            "totalSize" => encode(snapshot.total_retained_size()),
            _ => Err(self.unknown(property)),
        }
    }

    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        let snapshot = self.snapshot.as_ref();
        match method {
            "updateStaticData" => encode(serde_json::json!({
                "nodeCount": snapshot.node_count(),
                "rootNodeIndex": snapshot.graph().root_index(),
                "totalSize": snapshot.total_retained_size(),
                "maxJSObjectId": snapshot.last_seen_object_id(),
            })),
            "getStatistics" => encode(snapshot.statistics()),
            "getSamples" => encode(snapshot.samples()),
            "getLocation" => encode(snapshot.location(arg(args, 0)?)),
            "aggregatesWithFilter" => {
                let filter: Option<NodeFilter> = arg(args, 0)?;
                let aggregates = snapshot.aggregates(&filter.unwrap_or_default())?;
                encode(&aggregates.classes)
            }
            "aggregatesForDiff" => encode(&*snapshot.aggregates_for_diff()?),
            "calculateSnapshotDiff" => {
                let base_snapshot_id: String = arg(args, 0)?;
                let base: HashMap<String, AggregateForDiff> = arg(args, 1)?;
                encode(&*snapshot.calculate_snapshot_diff(&base_snapshot_id, &base)?)
            }
            "search" => {
                let config: SearchConfig = arg(args, 0)?;
                let filter: Option<NodeFilter> = arg(args, 1)?;
                encode(snapshot.search(&config, &filter.unwrap_or_default())?)
            }
            "nodeClassName" => encode(snapshot.node_class_name(arg(args, 0)?)),
            "idsOfObjectsWithName" => {
                let name: String = arg(args, 0)?;
                encode(snapshot.ids_of_objects_with_name(&name))
            }
            "lastSeenObjectId" => encode(snapshot.last_seen_object_id()),
            "allocationTracesTops" => encode(snapshot.allocation_profile()?.serialize_trace_tops()),
            "allocationNodeCallers" => {
                encode(snapshot.allocation_profile()?.serialize_callers(arg(args, 0)?)?)
            }
            "allocationStack" => encode(snapshot.allocation_stack(arg(args, 0)?)?),
            "problemReports" => encode(
                snapshot
                    .problem_reports()
                    .iter()
                    .map(|report| report.to_string())
                    .collect::<Vec<_>>(),
            ),
            _ => Err(self.unknown(method)),
        }
    }

    fn create(&mut self, method: &str, args: &[Value]) -> Result<Box<dyn EngineObject>> {
        let snapshot = Rc::clone(&self.snapshot);
        let provider = match method {
            "createEdgesProvider" => ItemProvider::edges(snapshot, arg(args, 0)?)?,
            "createRetainingEdgesProvider" => {
                ItemProvider::retaining_edges(snapshot, arg(args, 0)?)?
            }
            "createNodesProviderForClass" => {
                let class_name: String = arg(args, 0)?;
                let filter: Option<NodeFilter> = arg(args, 1)?;
                ItemProvider::class_nodes(snapshot, &class_name, &filter.unwrap_or_default())?
            }
            "createAddedNodesProvider" => {
                let base_snapshot_id: String = arg(args, 0)?;
                let class_name: String = arg(args, 1)?;
                ItemProvider::added_nodes(snapshot, &base_snapshot_id, &class_name)
            }
            "createDeletedNodesProvider" => ItemProvider::deleted_nodes(snapshot, arg(args, 0)?)?,
            "createDominatedNodesProvider" => {
                ItemProvider::dominated_nodes(snapshot, arg(args, 0)?)?
            }
            "createAllocationProfile" => {
                snapshot.allocation_profile()?;
                return Ok(Box::new(AllocationObject { snapshot }));
            }
            _ => return Err(self.unknown(method)),
        };
        Ok(Box::new(ProviderObject { provider }))
    }
}

struct ProviderObject {
    provider: ItemProvider,
}

impl EngineObject for ProviderObject {
    fn object_type(&self) -> &'static str {
        "ItemProvider"
    }

    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "isEmpty" => encode(self.provider.is_empty()),
            "serializeItemsRange" => {
                let begin: usize = arg(args, 0)?;
                let end: usize = arg(args, 1)?;
                encode(self.provider.serialize_items_range(begin, end)?)
            }
            "sortAndRewind" => {
                let comparator: ComparatorConfig = arg(args, 0)?;
                self.provider.sort_and_rewind(&comparator)?;
                Ok(Value::Null)
            }
            "nodePosition" => encode(self.provider.node_position(arg(args, 0)?)),
            _ => Err(self.unknown(method)),
        }
    }
}

/// Allocation profile view of a snapshot that has allocation traces.
struct AllocationObject {
    snapshot: Rc<HeapSnapshot>,
}

impl EngineObject for AllocationObject {
    fn object_type(&self) -> &'static str {
        "AllocationProfile"
    }

    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        let profile = self.snapshot.allocation_profile()?;
        match method {
            "serializeTraceTops" => encode(profile.serialize_trace_tops()),
            "serializeCallers" => encode(profile.serialize_callers(arg(args, 0)?)?),
            "serializeAllocationStack" => {
                encode(profile.serialize_allocation_stack(arg(args, 0)?)?)
            }
            "traceIds" => encode(profile.trace_ids(arg(args, 0)?)?),
            _ => Err(self.unknown(method)),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Object table plus the pending event queue.
#[derive(Default)]
pub struct Dispatcher {
    objects: HashMap<ObjectId, Box<dyn EngineObject>>,
    events: EventQueue,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one request. Errors become error responses.
    pub fn dispatch(&mut self, request: Request) -> Response {
        let call_id = request.call_id;
        let method_name = request.method_name.clone();
        match self.handle(request) {
            Ok(result) => Response::ok(call_id, result),
            Err(err) => {
                warn!(call_id, method = method_name.as_deref().unwrap_or(""), "{}", err);
                Response::failed(call_id, &err, method_name)
            }
        }
    }

    /// Events raised since the last call.
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn handle(&mut self, request: Request) -> Result<Value> {
        let Request {
            disposition,
            object_id,
            object_type,
            method_name,
            method_arguments,
            new_object_id,
            ..
        } = request;

        match disposition {
            Disposition::Create => {
                let object_id = object_id.ok_or(DispatchError::MissingField("objectId"))?;
                let object_type = object_type.ok_or(DispatchError::MissingField("objectType"))?;
                let object = self.instantiate(&object_type)?;
                debug!(object_id, object_type = %object_type, "created");
                self.objects.insert(object_id, object);
                Ok(Value::Null)
            }
            Disposition::Dispose => {
                let object_id = object_id.ok_or(DispatchError::MissingField("objectId"))?;
                self.objects
                    .remove(&object_id)
                    .ok_or(DispatchError::UnknownObject(object_id))?;
                Ok(Value::Null)
            }
            Disposition::Getter => {
                let property = method_name.ok_or(DispatchError::MissingField("methodName"))?;
                self.object(object_id)?.get(&property)
            }
            Disposition::Method => {
                let method = method_name.ok_or(DispatchError::MissingField("methodName"))?;
                self.object(object_id)?.call(&method, &method_arguments)
            }
            Disposition::Factory => {
                let method = method_name.ok_or(DispatchError::MissingField("methodName"))?;
                let new_object_id =
                    new_object_id.ok_or(DispatchError::MissingField("newObjectId"))?;
                let created = self.object(object_id)?.create(&method, &method_arguments)?;
                debug!(new_object_id, object_type = created.object_type(), "created");
                self.objects.insert(new_object_id, created);
                Ok(Value::Bool(true))
            }
            Disposition::EvaluateForTest => {
                let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
                ids.sort_unstable();
                encode(ids)
            }
        }
    }

    fn instantiate(&self, object_type: &str) -> Result<Box<dyn EngineObject>> {
        match object_type {
            "HeapSnapshotLoader" => {
                let progress = EventProgress {
                    events: Rc::clone(&self.events),
                };
                Ok(Box::new(LoaderObject {
                    loader: Loader::with_progress(Box::new(progress)),
                    raw: None,
                    events: Rc::clone(&self.events),
                }))
            }
            other => Err(DispatchError::UnknownObjectType(other.to_string())),
        }
    }

    fn object(&mut self, object_id: Option<ObjectId>) -> Result<&mut Box<dyn EngineObject>> {
        let object_id = object_id.ok_or(DispatchError::MissingField("objectId"))?;
        self.objects
            .get_mut(&object_id)
            .ok_or(DispatchError::UnknownObject(object_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SnapshotBuilder, diamond};
    use serde_json::json;

    fn request(value: Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    struct Session {
        dispatcher: Dispatcher,
        next_call: u64,
    }

    impl Session {
        fn new() -> Self {
            Session {
                dispatcher: Dispatcher::new(),
                next_call: 1,
            }
        }

        fn send(&mut self, mut body: Value) -> Response {
            body["callId"] = json!(self.next_call);
            self.next_call += 1;
            let response = self.dispatcher.dispatch(request(body));
            assert_eq!(response.call_id, self.next_call - 1);
            response
        }

        fn method(&mut self, object_id: u64, method: &str, args: Value) -> Response {
            self.send(json!({
                "disposition": "method",
                "objectId": object_id,
                "methodName": method,
                "methodArguments": args,
            }))
        }

        fn factory(&mut self, object_id: u64, method: &str, args: Value, new_id: u64) -> Response {
            self.send(json!({
                "disposition": "factory",
                "objectId": object_id,
                "methodName": method,
                "methodArguments": args,
                "newObjectId": new_id,
            }))
        }

        /// Loads `builder` as object 2 through loader object 1.
        fn load(&mut self, builder: &SnapshotBuilder) {
            let payload = builder.to_json();
            let (head, tail) = payload.split_at(payload.len() / 2);
            let created = self.send(json!({
                "disposition": "create",
                "objectId": 1,
                "objectType": "HeapSnapshotLoader",
            }));
            assert!(created.error.is_none());
            assert!(self.method(1, "write", json!([head])).error.is_none());
            assert!(self.method(1, "write", json!([tail])).error.is_none());
            assert!(self.method(1, "close", json!([])).error.is_none());
            let built = self.factory(1, "buildSnapshot", json!([{ "generic": true }]), 2);
            assert_eq!(built.result, json!(true));
        }
    }

    #[test]
    fn load_and_query_snapshot() {
        let mut session = Session::new();
        session.load(&diamond());
        let events = session.dispatcher.take_events();
        assert!(events.iter().all(|e| e.event_name == EventName::ProgressUpdate));
        assert!(!events.is_empty());

        let data = session.method(2, "updateStaticData", json!([]));
        assert_eq!(data.result["nodeCount"], json!(4));
        assert_eq!(data.result["totalSize"], json!(25.0));
        assert_eq!(data.result["maxJSObjectId"], json!(7));

        let aggregates = session.method(2, "aggregatesWithFilter", json!([{}]));
        assert_eq!(aggregates.result["C"]["count"], json!(1));
        assert_eq!(aggregates.result["C"]["maxRet"], json!(5.0));

        let found = session.method(2, "search", json!([{ "query": "c", "caseSensitive": true }]));
        assert_eq!(found.result, json!([]));
        let found = session.method(2, "search", json!([{ "query": "c" }]));
        assert_eq!(found.result, json!([7]));

        let title = session.send(json!({
            "disposition": "getter",
            "objectId": 2,
            "methodName": "nodeCount",
        }));
        assert_eq!(title.result, json!(4));
    }

    #[test]
    fn providers_page_through_results() {
        let mut session = Session::new();
        session.load(&diamond());
        let created = session.factory(2, "createDominatedNodesProvider", json!([0]), 3);
        assert!(created.error.is_none());
        assert_eq!(session.method(3, "isEmpty", json!([])).result, json!(false));
        let sorted = session.method(
            3,
            "sortAndRewind",
            json!([{
                "fieldName1": "retainedSize",
                "ascending1": false,
                "fieldName2": "id",
                "ascending2": true,
            }]),
        );
        assert!(sorted.error.is_none());
        let page = session.method(3, "serializeItemsRange", json!([0, 2]));
        assert_eq!(page.result["totalLength"], json!(3));
        assert_eq!(page.result["items"][0]["name"], json!("A"));
        assert_eq!(page.result["items"][1]["name"], json!("B"));
        assert_eq!(page.result["items"][0]["retainedSize"], json!(10.0));

        let edges = session.factory(2, "createEdgesProvider", json!([7]), 4);
        assert!(edges.error.is_none());
        let page = session.method(4, "serializeItemsRange", json!([0, 10]));
        assert_eq!(page.result["items"][0]["name"], json!("c"));
        assert_eq!(page.result["items"][0]["node"]["id"], json!(7));
        assert_eq!(page.result["items"][0]["type"], json!("property"));

        let ids = session.send(json!({ "disposition": "evaluateForTest" }));
        assert_eq!(ids.result, json!([1, 2, 3, 4]));
        let disposed = session.send(json!({ "disposition": "dispose", "objectId": 3 }));
        assert!(disposed.error.is_none());
        assert_eq!(session.dispatcher.object_count(), 3);
    }

    #[test]
    fn errors_are_reported_per_call() {
        let mut session = Session::new();
        session.load(&diamond());

        let missing = session.method(99, "isEmpty", json!([]));
        assert_eq!(missing.error.as_deref(), Some("no object with id 99"));
        assert_eq!(missing.error_method_name.as_deref(), Some("isEmpty"));

        let unknown = session.method(2, "frobnicate", json!([]));
        assert!(unknown.error.unwrap().contains("frobnicate"));

        let bad = session.method(2, "nodeClassName", json!(["seven"]));
        assert!(bad.error.unwrap().starts_with("bad arguments"));

        let range = session.factory(2, "createEdgesProvider", json!([3]), 5);
        assert!(range.error_call_stack.unwrap().contains("no node with index 3"));

        let no_profile = session.factory(2, "createAllocationProfile", json!([]), 6);
        assert!(no_profile.error.is_some());

        let bad_type = session.send(json!({
            "disposition": "create",
            "objectId": 7,
            "objectType": "Spaceship",
        }));
        assert!(bad_type.error.is_some());

        // The snapshot is still usable.
        let stats = session.method(2, "getStatistics", json!([]));
        assert_eq!(stats.result["total"], json!(25.0));
        assert_eq!(session.dispatcher.object_count(), 2);
    }

    #[test]
    fn broken_snapshot_raises_event() {
        let mut session = Session::new();
        session.send(json!({
            "disposition": "create",
            "objectId": 1,
            "objectType": "HeapSnapshotLoader",
        }));
        let payload = diamond().to_json();
        let cut = payload.find(",\n\"strings\"").unwrap();
        session.method(1, "write", json!([&payload[..cut]]));
        let closed = session.method(1, "close", json!([]));
        assert!(closed.error.is_some());
        let events = session.dispatcher.take_events();
        assert!(events.iter().any(|e| e.event_name == EventName::BrokenSnapshot));
        assert!(session.dispatcher.take_events().is_empty());
    }

    #[test]
    fn diff_between_two_sessions() {
        let mut base = Session::new();
        base.load(&diamond());
        let aggregates = base.method(2, "aggregatesForDiff", json!([])).result;

        let mut grown = diamond();
        let extra = grown.node("object", "C", 9, 6);
        grown.edge(1, "property", "more", extra);
        let mut target = Session::new();
        target.load(&grown);
        let diff = target.method(2, "calculateSnapshotDiff", json!(["base", aggregates]));
        assert_eq!(diff.result["C"]["addedCount"], json!(1));
        assert_eq!(diff.result["C"]["sizeDelta"], json!(6));

        let added = target.factory(2, "createAddedNodesProvider", json!(["base", "C"]), 3);
        assert!(added.error.is_none());
        let page = target.method(3, "serializeItemsRange", json!([0, 10]));
        assert_eq!(page.result["items"][0]["id"], json!(9));
    }
}
