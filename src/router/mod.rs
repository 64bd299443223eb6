//! Command dispatcher.
//!
//! A [`Request`] addresses the volume, a resource, a document or one property of a
//! document. The router resolves that scope, picks the registered [`Route`] for
//! `(method, command, scope)`, runs the access checks from [`acl`] and calls the
//! handler. Handlers return the crate [`Result`](crate::error::Result); [`Router::call`]
//! is the only place an [`Error`] turns into a status code.

pub mod acl;

pub use acl::{AccessLevel, Caller};

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::index::FindRequest;
use crate::metadata::{Permission, AUTHOR, GUID};
use crate::sync::OnlineSync;
use crate::volume::{EventFilter, Volume};

pub const JSON: &str = "application/json";
pub const EVENT_STREAM: &str = "application/x-ndjson";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// What a request addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Volume,
    Resource,
    Document,
    Property,
}

/// An incoming command.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub resource: Option<String>,
    pub guid: Option<String>,
    pub property: Option<String>,

    /// Command beyond plain CRUD, `cmd=<name>`.
    pub command: Option<String>,

    /// Extra arguments such as `raw` or `child`.
    pub params: BTreeMap<String, String>,

    pub content: Vec<u8>,
    pub content_type: Option<String>,

    /// Preferred languages, best first.
    pub accept_language: Vec<String>,

    pub caller: Caller,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            resource: None,
            guid: None,
            property: None,
            command: None,
            params: BTreeMap::new(),
            content: Vec::new(),
            content_type: None,
            accept_language: Vec::new(),
            caller: Caller::default(),
        }
    }

    /// Parses a `resource[/guid[/prop]]` path.
    pub fn path(mut self, path: &str) -> Self {
        let mut parts = path.split('/').filter(|part| !part.is_empty());
        self.resource = parts.next().map(str::to_string);
        self.guid = parts.next().map(str::to_string);
        self.property = parts.next().map(str::to_string);
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.content = value.to_string().into_bytes();
        self.content_type = Some(JSON.to_string());
        self
    }

    pub fn bytes(mut self, content: Vec<u8>, content_type: Option<String>) -> Self {
        self.content = content;
        self.content_type = content_type;
        self
    }

    pub fn languages(mut self, languages: &[&str]) -> Self {
        self.accept_language = languages.iter().map(|lang| lang.to_string()).collect();
        self
    }

    pub fn caller(mut self, caller: Caller) -> Self {
        self.caller = caller;
        self
    }

    pub fn scope(&self) -> Result<Scope> {
        match (&self.resource, &self.guid, &self.property) {
            (None, None, None) => Ok(Scope::Volume),
            (Some(_), None, None) => Ok(Scope::Resource),
            (Some(_), Some(_), None) => Ok(Scope::Document),
            (Some(_), Some(_), Some(_)) => Ok(Scope::Property),
            _ => Err(Error::InvalidValue("malformed path".to_string())),
        }
    }

    fn content_json<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T> {
        if self.content.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_slice(&self.content)
            .map_err(|e| Error::InvalidValue(format!("bad request content: {}", e)))
    }

    fn flag(&self, name: &str) -> bool {
        matches!(
            self.params.get(name).map(String::as_str),
            Some("1" | "true" | "yes")
        )
    }

    fn list_param(&self, name: &str) -> Vec<String> {
        self.params
            .get(name)
            .map(|value| {
                value
                    .split(',')
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Response payload.
pub enum Body {
    Bytes(Vec<u8>),
    /// Line-delimited JSON events, one per item.
    Lines(Pin<Box<dyn Stream<Item = String> + Send>>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Lines(_) => f.write_str("Lines"),
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content: Body,
    pub content_type: String,
    pub content_length: Option<u64>,

    /// Unix seconds of the addressed object's last change.
    pub last_modified: Option<i64>,

    /// Target of a 303 response.
    pub location: Option<String>,
}

impl Response {
    pub fn json(value: &serde_json::Value) -> Self {
        Self::bytes(value.to_string().into_bytes(), JSON)
    }

    pub fn bytes(content: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_length: Some(content.len() as u64),
            content: Body::Bytes(content),
            content_type: content_type.into(),
            last_modified: None,
            location: None,
        }
    }

    fn lines(stream: Pin<Box<dyn Stream<Item = String> + Send>>) -> Self {
        Self {
            status: 200,
            content: Body::Lines(stream),
            content_type: EVENT_STREAM.to_string(),
            content_length: None,
            last_modified: None,
            location: None,
        }
    }

    fn error(error: &Error) -> Self {
        let mut response = Self::json(&json!({"error": error.to_string()}));
        response.status = error.status();
        if let Error::Redirect(url) = error {
            response.location = Some(url.clone());
        }
        response
    }

    fn modified(mut self, mtime: Option<i64>) -> Self {
        self.last_modified = mtime;
        self
    }

    /// Payload bytes; empty for streams.
    pub fn body(&self) -> &[u8] {
        match &self.content {
            Body::Bytes(bytes) => bytes,
            Body::Lines(_) => &[],
        }
    }

    /// Payload parsed as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(self.body())?)
    }
}

/// Handler kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Create,
    Find,
    Get,
    GetProp,
    Update,
    SetProp,
    Delete,
    StatBlob,
    Aggregate,
    Disaggregate,
    Stat,
    Subscribe,
    SyncState,
}

/// One registered handler.
#[derive(Clone, Copy, Debug)]
pub struct Route {
    pub method: Method,
    pub command: Option<&'static str>,
    pub scope: Scope,

    /// Access the handler needs.
    pub permissions: Permission,

    op: Op,
}

impl Route {
    fn new(method: Method, command: Option<&'static str>, scope: Scope, permissions: Permission, op: Op) -> Self {
        Self {
            method,
            command,
            scope,
            permissions,
            op,
        }
    }
}

fn routes() -> Vec<Route> {
    use Method::*;
    use Scope::*;

    let auth = Permission::AUTH;
    let author = Permission::AUTH | Permission::AUTHOR;
    vec![
        Route::new(Post, None, Resource, Permission::CREATE | auth, Op::Create),
        Route::new(Get, None, Resource, Permission::READ, Op::Find),
        Route::new(Get, None, Document, Permission::READ, Op::Get),
        Route::new(Get, None, Property, Permission::READ, Op::GetProp),
        Route::new(Put, None, Document, Permission::WRITE | author, Op::Update),
        Route::new(Put, None, Property, Permission::WRITE | author, Op::SetProp),
        Route::new(Delete, None, Document, Permission::WRITE | author, Op::Delete),
        Route::new(Get, Some("stat"), Property, Permission::READ, Op::StatBlob),
        Route::new(Put, Some("aggregate"), Property, Permission::WRITE | auth, Op::Aggregate),
        Route::new(Delete, Some("aggregate"), Property, Permission::WRITE | author, Op::Disaggregate),
        Route::new(Get, Some("stat"), Volume, Permission::READ, Op::Stat),
        Route::new(Get, Some("subscribe"), Volume, Permission::READ, Op::Subscribe),
        Route::new(Get, Some("sync"), Volume, Permission::LOCAL, Op::SyncState),
    ]
}

/// Dispatches requests against one volume.
pub struct Router {
    volume: Arc<Volume>,
    online: Option<Arc<OnlineSync>>,
    routes: Vec<Route>,
}

impl Router {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self {
            volume,
            online: None,
            routes: routes(),
        }
    }

    /// Enables commands that need the online peer.
    pub fn with_online(mut self, online: Arc<OnlineSync>) -> Self {
        self.online = Some(online);
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Runs a request and renders any failure as an error response.
    pub async fn call(&self, request: Request) -> Response {
        let method = request.method;
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.status() >= 500 {
                    warn!(method = ?method, "Request failed: {}", e);
                } else {
                    debug!(method = ?method, status = e.status(), "Request rejected: {}", e);
                }
                Response::error(&e)
            }
        }
    }

    /// Runs a request.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let scope = request.scope()?;
        let route = self
            .routes
            .iter()
            .find(|route| {
                route.method == request.method
                    && route.scope == scope
                    && route.command == request.command.as_deref()
            })
            .copied()
            .ok_or_else(|| {
                Error::InvalidValue(format!(
                    "no handler for {:?} {:?} on {:?}",
                    request.method, request.command, scope
                ))
            })?;
        request.caller.check_route(route.permissions)?;

        match route.op {
            Op::Create => self.create(&request).await,
            Op::Find => self.find(&request),
            Op::Get => self.get(&request),
            Op::GetProp => self.get_prop(&request).await,
            Op::Update => self.update(&request, route.permissions).await,
            Op::SetProp => self.set_prop(&request, route.permissions).await,
            Op::Delete => self.delete(&request, route.permissions).await,
            Op::StatBlob => self.stat_blob(&request),
            Op::Aggregate => self.aggregate(&request, route.permissions, true).await,
            Op::Disaggregate => self.aggregate(&request, route.permissions, false).await,
            Op::Stat => self.stat(),
            Op::Subscribe => self.subscribe(&request),
            Op::SyncState => self.sync_state(),
        }
    }

    fn directory(&self, request: &Request) -> Result<&Arc<Directory>> {
        let resource = request
            .resource
            .as_deref()
            .ok_or_else(|| Error::InvalidValue("resource is missing".to_string()))?;
        self.volume.directory(resource)
    }

    fn languages(&self, request: &Request) -> Vec<String> {
        if request.accept_language.is_empty() {
            self.volume.config().languages.clone()
        } else {
            request.accept_language.clone()
        }
    }

    /// Names of the properties the caller may read, restricted to `reply` if given.
    fn visible(&self, directory: &Directory, caller: &Caller, reply: &[String]) -> Result<Vec<String>> {
        let metadata = directory.metadata();
        if reply.is_empty() {
            return Ok(metadata
                .iter()
                .filter(|prop| !prop.blob && caller.can_see(prop))
                .map(|prop| prop.name.clone())
                .collect());
        }
        reply
            .iter()
            .map(|name| {
                let prop = metadata
                    .get(name)
                    .ok_or_else(|| Error::InvalidValue(format!("unknown property {}", name)))?;
                caller.check_property(prop, Permission::READ)?;
                Ok(name.clone())
            })
            .collect()
    }

    fn authorize(&self, directory: &Directory, request: &Request, mask: Permission) -> Result<()> {
        if !mask.contains(Permission::AUTHOR) || request.caller.is_local() {
            return Ok(());
        }
        let guid = request.guid.as_deref().unwrap_or_default();
        let authors: Vec<String> = directory
            .get(guid)?
            .get(AUTHOR)?
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        request.caller.check_author(mask, &authors)
    }

    fn check_props(
        &self,
        directory: &Directory,
        caller: &Caller,
        props: &serde_json::Map<String, serde_json::Value>,
        access: Permission,
    ) -> Result<()> {
        for name in props.keys() {
            if let Some(prop) = directory.metadata().get(name) {
                caller.check_property(prop, access)?;
            }
        }
        Ok(())
    }

    async fn create(&self, request: &Request) -> Result<Response> {
        let directory = self.directory(request)?;
        let mut props: serde_json::Map<String, serde_json::Value> = request.content_json()?;
        self.check_props(directory, &request.caller, &props, Permission::CREATE)?;
        if let Some(principal) = &request.caller.principal {
            props
                .entry(AUTHOR.to_string())
                .or_insert_with(|| json!([principal]));
        }
        let guid = directory.create(props).await?;
        Ok(Response::json(&json!(guid)))
    }

    fn find(&self, request: &Request) -> Result<Response> {
        let directory = self.directory(request)?;
        let mut find: FindRequest = request.content_json()?;
        if find.languages.is_empty() {
            find.languages = self.languages(request);
        }
        if !request.caller.is_local() {
            find.include_deleted = false;
        }
        let reply = self.visible(directory, &request.caller, &find.reply)?;

        let (documents, total) = directory.find(&find)?;
        let mut result = Vec::with_capacity(documents.len());
        for document in documents {
            let mut item = document.to_json(&reply, &find.languages)?;
            item.insert(GUID.to_string(), json!(document.guid()));
            if let Some(grouped) = document.grouped() {
                item.insert("grouped".to_string(), json!(grouped));
            }
            result.push(serde_json::Value::Object(item));
        }
        Ok(Response::json(&json!({"total": total, "result": result})))
    }

    fn get(&self, request: &Request) -> Result<Response> {
        let directory = self.directory(request)?;
        let guid = request.guid.as_deref().unwrap_or_default();
        let document = directory.get(guid)?;
        let reply = self.visible(directory, &request.caller, &request.list_param("reply"))?;
        let props = document.to_json(&reply, &self.languages(request))?;
        let mtime = document.mtime()?;
        Ok(Response::json(&serde_json::Value::Object(props)).modified(Some(mtime)))
    }

    async fn get_prop(&self, request: &Request) -> Result<Response> {
        let directory = self.directory(request)?;
        let (guid, name) = target(request);
        let prop = directory.metadata().require(name)?;
        request.caller.check_property(prop, Permission::READ)?;

        if prop.blob {
            let blob = directory.get_blob(guid, name).await?;
            return Ok(Response::bytes(blob.data, blob.meta.mime_type).modified(Some(blob.mtime)));
        }

        let document = directory.get(guid)?;
        let meta = document
            .meta(name)?
            .ok_or_else(|| Error::NotFound(format!("{}/{}", guid, name)))?;
        let value = if prop.localized {
            document
                .get_localized(name, &self.languages(request))?
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null)
        } else {
            document.get(name)?.unwrap_or(meta.value)
        };
        Ok(Response::json(&value).modified(Some(meta.mtime)))
    }

    async fn update(&self, request: &Request, mask: Permission) -> Result<Response> {
        let directory = self.directory(request)?;
        let guid = request.guid.as_deref().unwrap_or_default();
        self.authorize(directory, request, mask)?;
        let props: serde_json::Map<String, serde_json::Value> = request.content_json()?;
        self.check_props(directory, &request.caller, &props, Permission::WRITE)?;
        directory.update(guid, props).await?;
        Ok(Response::json(&serde_json::Value::Null))
    }

    async fn set_prop(&self, request: &Request, mask: Permission) -> Result<Response> {
        let directory = self.directory(request)?;
        let (guid, name) = target(request);
        let prop = directory.metadata().require(name)?;
        request.caller.check_property(prop, Permission::WRITE)?;
        self.authorize(directory, request, mask)?;

        if prop.blob {
            let blob = directory
                .set_blob(
                    guid,
                    name,
                    Cursor::new(request.content.clone()),
                    request.content_type.clone(),
                )
                .await?;
            return Ok(Response::json(&serde_json::to_value(&blob)?));
        }

        let value: serde_json::Value = serde_json::from_slice(&request.content)
            .map_err(|e| Error::InvalidValue(format!("bad value for {}: {}", name, e)))?;
        let mut props = serde_json::Map::new();
        props.insert(name.to_string(), value);
        directory.update(guid, props).await?;
        Ok(Response::json(&serde_json::Value::Null))
    }

    async fn delete(&self, request: &Request, mask: Permission) -> Result<Response> {
        let directory = self.directory(request)?;
        let guid = request.guid.as_deref().unwrap_or_default();
        self.authorize(directory, request, mask)?;

        // Remote callers only ever hide documents.
        let raw = request.caller.is_local() && request.flag("raw");
        directory.delete(guid, raw).await?;
        Ok(Response::json(&serde_json::Value::Null))
    }

    fn stat_blob(&self, request: &Request) -> Result<Response> {
        let directory = self.directory(request)?;
        let (guid, name) = target(request);
        let prop = directory.metadata().require(name)?;
        request.caller.check_property(prop, Permission::READ)?;
        let blob = directory.stat_blob(guid, name)?;
        Ok(Response::json(&serde_json::to_value(&blob)?))
    }

    async fn aggregate(&self, request: &Request, mask: Permission, enable: bool) -> Result<Response> {
        let directory = self.directory(request)?;
        let (guid, name) = target(request);
        let prop = directory.metadata().require(name)?;
        request.caller.check_property(prop, Permission::WRITE)?;
        self.authorize(directory, request, mask)?;

        let child = request
            .params
            .get("child")
            .ok_or_else(|| Error::InvalidValue("child is missing".to_string()))?;
        if enable {
            directory.aggregate(guid, name, child).await?;
        } else {
            directory.disaggregate(guid, name, child).await?;
        }
        Ok(Response::json(&json!(directory.count_aggregated(guid, name)?)))
    }

    fn stat(&self) -> Result<Response> {
        let resources: Vec<&str> = self.volume.resources().collect();
        let online = self.online.as_ref().map_or(false, |online| online.is_online());
        Ok(Response::json(&json!({
            "seqno": self.volume.seqno(),
            "resources": resources,
            "online": online,
        })))
    }

    fn subscribe(&self, request: &Request) -> Result<Response> {
        let filter: EventFilter = request.content_json()?;
        if let Some(resource) = &filter.resource {
            self.volume.directory(resource)?;
        }
        let stream = self.volume.subscribe(filter).into_stream().map(|event| event.to_line());
        Ok(Response::lines(Box::pin(stream)))
    }

    fn sync_state(&self) -> Result<Response> {
        let online = self
            .online
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("online sync is not configured".to_string()))?;
        online.require_online()?;
        Ok(Response::json(&json!({
            "to_send": online.to_send(),
            "to_receive": online.to_receive(),
        })))
    }
}

fn target(request: &Request) -> (&str, &str) {
    (
        request.guid.as_deref().unwrap_or_default(),
        request.property.as_deref().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::{Metadata, PropertyDescriptor, Typecast};
    use crate::volume::EventKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resources() -> Vec<Metadata> {
        vec![Metadata::new(
            "context",
            vec![
                PropertyDescriptor::new("title", Typecast::Str)
                    .slot(10)
                    .prefix("T")
                    .full_text()
                    .localized(),
                PropertyDescriptor::new("notes", Typecast::Str)
                    .default(json!(""))
                    .permissions(Permission::PUBLIC | Permission::LOCAL),
                PropertyDescriptor::blob("icon", "image/png"),
                PropertyDescriptor::aggregated("tags"),
            ],
        )
        .unwrap()]
    }

    fn router(dir: &TempDir) -> (Arc<Volume>, Router) {
        let config = Config::new(dir.path()).with_flush(1, Duration::ZERO);
        let volume = Arc::new(Volume::open(config, resources()).unwrap());
        (volume.clone(), Router::new(volume))
    }

    fn alice() -> Caller {
        Caller::remote(Some("alice".into()))
    }

    async fn create(router: &Router, caller: Caller, props: serde_json::Value) -> String {
        let response = router
            .call(Request::new(Method::Post).path("context").json(&props).caller(caller))
            .await;
        assert_eq!(response.status, 200, "{:?}", response.to_json());
        response.to_json().unwrap().as_str().unwrap().to_string()
    }

    #[test]
    fn test_scope_resolution() {
        assert_eq!(Request::new(Method::Get).scope().unwrap(), Scope::Volume);
        assert_eq!(Request::new(Method::Get).path("context").scope().unwrap(), Scope::Resource);
        assert_eq!(Request::new(Method::Get).path("/context/g/").scope().unwrap(), Scope::Document);
        assert_eq!(Request::new(Method::Get).path("context/g/title").scope().unwrap(), Scope::Property);

        let mut request = Request::new(Method::Get);
        request.guid = Some("g".into());
        assert!(request.scope().is_err());
    }

    #[tokio::test]
    async fn test_crud_through_router() {
        let temp_dir = TempDir::new().unwrap();
        let (volume, router) = router(&temp_dir);

        let guid = create(&router, alice(), json!({"title": {"en": "Hello", "fr": "Salut"}})).await;

        let response = router
            .call(Request::new(Method::Get).path(&format!("context/{}", guid)).languages(&["fr"]))
            .await;
        assert_eq!(response.status, 200);
        assert!(response.last_modified.is_some());
        let doc = response.to_json().unwrap();
        assert_eq!(doc["title"], json!("Salut"));
        assert_eq!(doc["author"], json!(["alice"]));
        assert!(doc.get("notes").is_none());

        let response = router
            .call(
                Request::new(Method::Put)
                    .path(&format!("context/{}/title", guid))
                    .json(&json!({"en": "Bye"}))
                    .caller(alice()),
            )
            .await;
        assert_eq!(response.status, 200);

        let response = router
            .call(Request::new(Method::Get).path("context").json(&json!({"query": "bye"})))
            .await;
        let found = response.to_json().unwrap();
        assert_eq!(found["total"], json!(1));
        assert_eq!(found["result"][0]["guid"], json!(guid));

        let response = router
            .call(Request::new(Method::Get).path(&format!("context/{}/missing", guid)))
            .await;
        assert_eq!(response.status, 400);
        let response = router.call(Request::new(Method::Get).path("context/nope")).await;
        assert_eq!(response.status, 404);
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_access_control() {
        let temp_dir = TempDir::new().unwrap();
        let (volume, router) = router(&temp_dir);

        let response = router
            .call(
                Request::new(Method::Post)
                    .path("context")
                    .json(&json!({"title": "x"}))
                    .caller(Caller::remote(None)),
            )
            .await;
        assert_eq!(response.status, 401);

        let guid = create(&router, alice(), json!({"title": "x"})).await;
        let path = format!("context/{}", guid);

        let bob = Caller::remote(Some("bob".into()));
        let response = router
            .call(Request::new(Method::Put).path(&path).json(&json!({"title": "y"})).caller(bob))
            .await;
        assert_eq!(response.status, 403);

        let response = router
            .call(
                Request::new(Method::Put)
                    .path(&format!("{}/notes", path))
                    .json(&json!("secret"))
                    .caller(alice()),
            )
            .await;
        assert_eq!(response.status, 403);

        let response = router
            .call(
                Request::new(Method::Put)
                    .path(&format!("{}/notes", path))
                    .json(&json!("secret"))
                    .caller(Caller::local()),
            )
            .await;
        assert_eq!(response.status, 200);

        let response = router.call(Request::new(Method::Get).command("sync")).await;
        assert_eq!(response.status, 403);
        let response = router
            .call(Request::new(Method::Get).command("sync").caller(Caller::local()))
            .await;
        assert_eq!(response.status, 500);
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_delete_is_soft() {
        let temp_dir = TempDir::new().unwrap();
        let (volume, router) = router(&temp_dir);
        let guid = create(&router, alice(), json!({"title": "x"})).await;
        let path = format!("context/{}", guid);

        let response = router
            .call(Request::new(Method::Delete).path(&path).param("raw", "true").caller(alice()))
            .await;
        assert_eq!(response.status, 200);
        let directory = volume.directory("context").unwrap();
        let layer = directory.get(&guid).unwrap().get("layer").unwrap().unwrap();
        assert!(layer.as_array().unwrap().contains(&json!("deleted")));

        let response = router.call(Request::new(Method::Get).path("context")).await;
        assert_eq!(response.to_json().unwrap()["total"], json!(0));

        let response = router
            .call(
                Request::new(Method::Delete)
                    .path(&path)
                    .param("raw", "true")
                    .caller(Caller::local()),
            )
            .await;
        assert_eq!(response.status, 200);
        assert!(matches!(directory.get(&guid), Err(Error::NotFound(_))));
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_blob_and_aggregate_commands() {
        let temp_dir = TempDir::new().unwrap();
        let (volume, router) = router(&temp_dir);
        let guid = create(&router, alice(), json!({"title": "x"})).await;
        let icon = format!("context/{}/icon", guid);

        let response = router
            .call(
                Request::new(Method::Put)
                    .path(&icon)
                    .bytes(b"PNG".to_vec(), Some("image/png".into()))
                    .caller(alice()),
            )
            .await;
        assert_eq!(response.status, 200);

        let response = router.call(Request::new(Method::Get).path(&icon)).await;
        assert_eq!(response.body(), b"PNG");
        assert_eq!(response.content_type, "image/png");
        assert_eq!(response.content_length, Some(3));

        let response = router
            .call(Request::new(Method::Get).path(&icon).command("stat"))
            .await;
        assert_eq!(response.to_json().unwrap()["size"], json!(3));

        let tags = format!("context/{}/tags", guid);
        let response = router
            .call(
                Request::new(Method::Put)
                    .path(&tags)
                    .command("aggregate")
                    .param("child", "rust")
                    .caller(alice()),
            )
            .await;
        assert_eq!(response.to_json().unwrap(), json!(1));
        let response = router
            .call(
                Request::new(Method::Delete)
                    .path(&tags)
                    .command("aggregate")
                    .param("child", "rust")
                    .caller(alice()),
            )
            .await;
        assert_eq!(response.to_json().unwrap(), json!(0));
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_renders_lines() {
        let temp_dir = TempDir::new().unwrap();
        let (volume, router) = router(&temp_dir);

        let filter = json!({"resource": "context", "events": ["create"]});
        let response = router
            .call(Request::new(Method::Get).command("subscribe").json(&filter))
            .await;
        assert_eq!(response.content_type, EVENT_STREAM);
        let Body::Lines(mut lines) = response.content else {
            panic!("expected a stream");
        };

        let guid = create(&router, alice(), json!({"title": "x"})).await;
        let line = lines.next().await.unwrap();
        assert!(line.ends_with('\n'));
        let event: crate::volume::Event = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(event.event, EventKind::Create);
        assert_eq!(event.guid.as_deref(), Some(guid.as_str()));

        let response = router
            .call(Request::new(Method::Get).command("subscribe").json(&json!({"resource": "nope"})))
            .await;
        assert_eq!(response.status, 404);
        volume.close().await.unwrap();
    }
}
