//! The fixed authorization schema.
//!
//! Seven object types with a closed relation set. The schema is the single
//! source of truth for three consumers: boundary validation of grant/revoke
//! requests, the authorization-model document installed into HTTP backends
//! by `ensure_model`, and the embedded in-memory evaluator.
//!
//! `reader`, `writer`, and `manager` are unions of directly assigned users
//! and anyone holding `admin` on the object; `admin` itself is inherited
//! down `parent` edges, which is what makes a tenant admin an implicit
//! reader of every log under that tenant.

use serde_json::{Value, json};

/// Relations that union in `admin` on the same object.
pub const ADMIN_UNION_RELATIONS: &[&str] = &["reader", "writer", "manager"];

/// One object type and its relations.
#[derive(Debug, Clone, Copy)]
pub struct TypeDef {
    /// Type tag (`tenant`, `log`, ...)
    pub name: &'static str,
    /// Relations assignable on this type (excluding `parent`)
    pub relations: &'static [&'static str],
    /// Allowed parent object types. Empty means the type has no `parent`.
    pub parent_types: &'static [&'static str],
}

/// The complete fixed schema.
///
/// `log` admits both `organization` and `tenant` parents: flat deployments
/// attach logs directly to the tenant without an organization layer.
pub const SCHEMA: &[TypeDef] = &[
    TypeDef {
        name: "tenant",
        relations: &["admin", "member", "exists"],
        parent_types: &[],
    },
    TypeDef {
        name: "organization",
        relations: &["admin", "member"],
        parent_types: &["tenant"],
    },
    TypeDef {
        name: "user",
        relations: &["identity"],
        parent_types: &[],
    },
    TypeDef {
        name: "role",
        relations: &["assignee"],
        parent_types: &["role"],
    },
    TypeDef {
        name: "log",
        relations: &["owner", "reader", "writer"],
        parent_types: &["organization", "tenant"],
    },
    TypeDef {
        name: "log_entry",
        relations: &["owner", "reader", "writer"],
        parent_types: &["log"],
    },
    TypeDef {
        name: "apikey",
        relations: &["owner", "manager"],
        parent_types: &["user"],
    },
    TypeDef {
        name: "system",
        relations: &["admin"],
        parent_types: &[],
    },
];

/// Look up a type definition by tag.
#[must_use]
pub fn type_def(name: &str) -> Option<&'static TypeDef> {
    SCHEMA.iter().find(|t| t.name == name)
}

/// `true` if `relation` is assignable on objects of `object_type`.
#[must_use]
pub fn relation_exists(object_type: &str, relation: &str) -> bool {
    type_def(object_type).is_some_and(|t| {
        relation == "parent" && !t.parent_types.is_empty() || t.relations.contains(&relation)
    })
}

/// `true` if an object of `child_type` may take a `parent_type` parent.
#[must_use]
pub fn parent_allowed(child_type: &str, parent_type: &str) -> bool {
    type_def(child_type).is_some_and(|t| t.parent_types.contains(&parent_type))
}

/// Render the authorization model document installed into HTTP backends.
///
/// The shape follows the store's authorization-model API: one type
/// definition per object type, `this`-or-`computed` unions for the
/// admin-backed relations, and directly-related-user-type constraints on
/// `parent` edges.
#[must_use]
pub fn model_document() -> Value {
    let type_definitions: Vec<Value> = SCHEMA
        .iter()
        .map(|t| {
            let mut relations = serde_json::Map::new();
            let mut metadata = serde_json::Map::new();

            for rel in t.relations {
                let definition = if ADMIN_UNION_RELATIONS.contains(rel) {
                    json!({
                        "union": {
                            "child": [
                                { "this": {} },
                                { "computedUserset": { "relation": "admin" } },
                            ]
                        }
                    })
                } else {
                    json!({ "this": {} })
                };
                relations.insert((*rel).to_string(), definition);
                metadata.insert(
                    (*rel).to_string(),
                    json!({ "directly_related_user_types": [{ "type": "user" }] }),
                );
            }

            if !t.parent_types.is_empty() {
                relations.insert("parent".to_string(), json!({ "this": {} }));
                let related: Vec<Value> = t
                    .parent_types
                    .iter()
                    .map(|p| json!({ "type": p }))
                    .collect();
                metadata.insert(
                    "parent".to_string(),
                    json!({ "directly_related_user_types": related }),
                );
            }

            json!({
                "type": t.name,
                "relations": Value::Object(relations),
                "metadata": { "relations": Value::Object(metadata) },
            })
        })
        .collect();

    json!({
        "schema_version": "1.1",
        "type_definitions": type_definitions,
    })
}
