//! Entity types ferry migrates out of the box.

use serde_json::Value;

use crate::handler::{
    EntityHandler, EntitySpec, FieldRule, HandlerRegistry, HandlerSettings, MappedHandler,
};

/// Migration order used when `ferry.toml` does not set `order`.
pub const DEFAULT_ORDER: &[&str] = &[
    "res.groups",
    "res.users",
    "res.partner",
    "product.attribute",
    "product.attribute.value",
    "product.template",
    "product.template.attribute.line",
];

/// Specs of every built-in entity type. `res.users` depends on the settings
/// for its company.
#[must_use]
pub fn specs(settings: &HandlerSettings) -> Vec<EntitySpec> {
    vec![
        EntitySpec::new("res.groups", ["name"]).copy_fields(&["name", "comment"]),
        users(settings.company_id),
        EntitySpec::new("res.partner", ["name"]).copy_fields(&[
            "name",
            "email",
            "phone",
            "street",
            "city",
            "zip",
            "is_company",
            "lang",
        ]),
        EntitySpec::new("product.attribute", ["name"]).copy_fields(&["name"]),
        EntitySpec::new("product.attribute.value", ["name", "attribute_id"])
            .copy_fields(&["name"])
            .field(FieldRule::reference("attribute_id", "product.attribute")),
        EntitySpec::new("product.template", ["name", "default_code"]).copy_fields(&[
            "name",
            "default_code",
            "list_price",
            "type",
        ]),
        EntitySpec::new(
            "product.template.attribute.line",
            ["attribute_id", "product_tmpl_id"],
        )
        .field(FieldRule::reference("attribute_id", "product.attribute"))
        .field(FieldRule::reference("product_tmpl_id", "product.template"))
        .field(FieldRule::reference_set("value_ids", "product.attribute.value")),
        EntitySpec::new("product.template.attribute.value", ["name", "default_code"])
            .copy_fields(&["name", "default_code"]),
    ]
}

fn users(company_id: Option<i64>) -> EntitySpec {
    let spec = EntitySpec::new("res.users", ["login"])
        .copy_fields(&["name", "login", "email", "lang", "tz"]);
    match company_id {
        Some(company) => spec.field(FieldRule::Constant {
            dest: "company_id".into(),
            value: Value::from(company),
        }),
        None => spec,
    }
}

/// Register every built-in entity type.
pub fn register_defaults(registry: &mut HandlerRegistry) {
    for spec in specs(&HandlerSettings::default()) {
        let name = spec.name.clone();
        if name == "res.users" {
            // Rebuilt per registry so the configured company is used.
            registry.register(
                name,
                Box::new(|settings: &HandlerSettings| -> Box<dyn EntityHandler> {
                    Box::new(MappedHandler::new(users(settings.company_id), settings))
                }),
            );
        } else {
            registry.register_spec(spec);
        }
    }
}
