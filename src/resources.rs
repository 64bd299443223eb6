//! Built-in resources of a node: users, contexts (activities, projects, content) and
//! posts attached to contexts.

use serde_json::json;

use crate::metadata::{Metadata, MetadataResult, Permission, PropertyDescriptor, Typecast};

pub const USER: &str = "user";
pub const CONTEXT: &str = "context";
pub const POST: &str = "post";

/// Every built-in resource.
pub fn all() -> MetadataResult<Vec<Metadata>> {
    Ok(vec![user()?, context()?, post()?])
}

pub fn user() -> MetadataResult<Metadata> {
    Metadata::new(
        USER,
        vec![
            PropertyDescriptor::new("name", Typecast::Str)
                .slot(10)
                .prefix("N")
                .full_text(),
            PropertyDescriptor::new("color", Typecast::Str).default(json!("#000000,#ffffff")),
            PropertyDescriptor::new("location", Typecast::Str)
                .prefix("O")
                .full_text()
                .default(json!("")),
            PropertyDescriptor::new("birthday", Typecast::Int)
                .slot(11)
                .default(json!(0)),
            PropertyDescriptor::new("pubkey", Typecast::Str)
                .default(json!(""))
                .permissions(Permission::CREATE | Permission::READ),
            PropertyDescriptor::blob("avatar", "image/png"),
        ],
    )
}

pub fn context() -> MetadataResult<Metadata> {
    Metadata::new(
        CONTEXT,
        vec![
            PropertyDescriptor::new(
                "type",
                Typecast::List(Box::new(Typecast::Enum(
                    ["activity", "project", "book", "group", "talks"]
                        .iter()
                        .map(|kind| kind.to_string())
                        .collect(),
                ))),
            )
            .prefix("T")
            .boolean()
            .default(json!(["project"])),
            PropertyDescriptor::new("title", Typecast::Str)
                .slot(10)
                .prefix("N")
                .full_text()
                .localized(),
            PropertyDescriptor::new("summary", Typecast::Str)
                .prefix("U")
                .full_text()
                .localized()
                .default(json!({})),
            PropertyDescriptor::new("description", Typecast::Str)
                .prefix("D")
                .full_text()
                .localized()
                .default(json!({})),
            PropertyDescriptor::new("homepage", Typecast::Str)
                .prefix("H")
                .boolean()
                .default(json!("")),
            PropertyDescriptor::new("mime_types", Typecast::List(Box::new(Typecast::Str)))
                .prefix("P")
                .boolean()
                .default(json!([])),
            PropertyDescriptor::new("tags", Typecast::List(Box::new(Typecast::Str)))
                .prefix("G")
                .boolean()
                .full_text()
                .default(json!([])),
            PropertyDescriptor::new("rating", Typecast::Float)
                .slot(11)
                .default(json!(0.0))
                .permissions(Permission::READ),
            PropertyDescriptor::new("downloads", Typecast::Int)
                .slot(12)
                .default(json!(0))
                .permissions(Permission::READ),
            PropertyDescriptor::new("favorite", Typecast::Bool)
                .prefix("F")
                .boolean()
                .default(json!(false))
                .permissions(Permission::PUBLIC | Permission::LOCAL),
            PropertyDescriptor::aggregated("dependencies"),
            PropertyDescriptor::blob("icon", "image/png"),
            PropertyDescriptor::blob("preview", "image/png"),
            PropertyDescriptor::blob("artifact_icon", "image/svg+xml"),
        ],
    )
}

pub fn post() -> MetadataResult<Metadata> {
    Metadata::new(
        POST,
        vec![
            PropertyDescriptor::new("context", Typecast::Str)
                .prefix("X")
                .boolean()
                .permissions(Permission::CREATE | Permission::READ),
            PropertyDescriptor::new(
                "type",
                Typecast::Enum(
                    ["review", "object", "question", "problem", "notice", "post"]
                        .iter()
                        .map(|kind| kind.to_string())
                        .collect(),
                ),
            )
            .prefix("T")
            .boolean()
            .permissions(Permission::CREATE | Permission::READ),
            PropertyDescriptor::new("topic", Typecast::Str)
                .prefix("P")
                .boolean()
                .default(json!("")),
            PropertyDescriptor::new("title", Typecast::Str)
                .slot(10)
                .prefix("N")
                .full_text()
                .localized(),
            PropertyDescriptor::new("message", Typecast::Str)
                .prefix("E")
                .full_text()
                .localized(),
            PropertyDescriptor::new("rating", Typecast::Int)
                .slot(11)
                .default(json!(0)),
            PropertyDescriptor::aggregated("votes"),
            PropertyDescriptor::aggregated("comments"),
            PropertyDescriptor::blob("preview", "image/png"),
            PropertyDescriptor::blob("data", "application/octet-stream"),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyKind;

    #[test]
    fn test_builtin_schemas_are_valid() {
        let resources = all().unwrap();
        let names: Vec<&str> = resources.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec![USER, CONTEXT, POST]);

        for metadata in &resources {
            assert!(metadata.get("guid").is_some());
            assert!(metadata.get("author").is_some());
            assert!(metadata.iter_kind(PropertyKind::Blob).all(|prop| !prop.is_indexed()));
        }
    }

    #[test]
    fn test_context_local_and_readonly_properties() {
        let context = context().unwrap();
        let favorite = context.get("favorite").unwrap();
        assert!(favorite.permissions.contains(Permission::LOCAL));
        let rating = context.get("rating").unwrap();
        assert!(!rating.permissions.contains(Permission::WRITE));
        assert_eq!(context.by_prefix("N").unwrap().name, "title");
    }
}
