//! Shared typed models and store fixtures for the runtime tests.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use ontograph_core::{
    from_field_map, to_field_map, EntityModel, EntitySchema, EventPayload, FieldSpec,
    OntologyConfig, RelationModel, RelationSchema, Result, TypeSpec,
};
use ontograph_runtime::{Ontology, OntologyBuilder, Session};
use ontograph_store::SqliteStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub age: i64,
    #[serde(default)]
    pub email: Option<String>,
}

impl EntityModel for Customer {
    fn entity_name() -> &'static str {
        "Customer"
    }

    fn schema() -> Result<EntitySchema> {
        EntitySchema::builder("Customer")
            .field("id", FieldSpec::new("str", TypeSpec::string()).primary_key())
            .field("name", FieldSpec::new("str", TypeSpec::string()))
            .field("age", FieldSpec::new("int", TypeSpec::integer()))
            .field(
                "email",
                FieldSpec::new("str | None", TypeSpec::optional(TypeSpec::string())),
            )
            .build()
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        to_field_map(self)
    }

    fn from_fields(fields: &Map<String, Value>) -> Result<Self> {
        from_field_map(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub price: f64,
}

impl EntityModel for Product {
    fn entity_name() -> &'static str {
        "Product"
    }

    fn schema() -> Result<EntitySchema> {
        EntitySchema::builder("Product")
            .field("sku", FieldSpec::new("str", TypeSpec::string()).primary_key())
            .field("price", FieldSpec::new("float", TypeSpec::float()))
            .build()
    }

    fn key(&self) -> String {
        self.sku.clone()
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        to_field_map(self)
    }

    fn from_fields(fields: &Map<String, Value>) -> Result<Self> {
        from_field_map(fields)
    }
}

/// Purchases carry an order id so the same customer/product pair can hold
/// many distinct edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchased {
    #[serde(skip)]
    pub customer_id: String,
    #[serde(skip)]
    pub product_sku: String,
    #[serde(skip)]
    pub order_id: String,
    pub quantity: i64,
}

impl RelationModel for Purchased {
    type Left = Customer;
    type Right = Product;

    fn relation_name() -> &'static str {
        "Purchased"
    }

    fn schema() -> Result<RelationSchema> {
        RelationSchema::builder("Purchased", "Customer", "Product")
            .instance_key("order_id")
            .field("quantity", FieldSpec::new("int", TypeSpec::integer()))
            .build()
    }

    fn left_key(&self) -> String {
        self.customer_id.clone()
    }

    fn right_key(&self) -> String {
        self.product_sku.clone()
    }

    fn instance_key(&self) -> Option<String> {
        Some(self.order_id.clone())
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        to_field_map(self)
    }

    fn from_row(
        left_key: &str,
        right_key: &str,
        instance_key: &str,
        fields: &Map<String, Value>,
    ) -> Result<Self> {
        let mut value: Purchased = from_field_map(fields)?;
        value.customer_id = left_key.to_string();
        value.product_sku = right_key.to_string();
        value.order_id = instance_key.to_string();
        Ok(value)
    }
}

/// Singleton edge per `(customer, product)`: no instance key declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wishlisted {
    #[serde(skip)]
    pub customer_id: String,
    #[serde(skip)]
    pub product_sku: String,
    pub rank: i64,
}

impl RelationModel for Wishlisted {
    type Left = Customer;
    type Right = Product;

    fn relation_name() -> &'static str {
        "Wishlisted"
    }

    fn schema() -> Result<RelationSchema> {
        RelationSchema::builder("Wishlisted", "Customer", "Product")
            .field("rank", FieldSpec::new("int", TypeSpec::integer()))
            .build()
    }

    fn left_key(&self) -> String {
        self.customer_id.clone()
    }

    fn right_key(&self) -> String {
        self.product_sku.clone()
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        to_field_map(self)
    }

    fn from_row(
        left_key: &str,
        right_key: &str,
        _instance_key: &str,
        fields: &Map<String, Value>,
    ) -> Result<Self> {
        let mut value: Wishlisted = from_field_map(fields)?;
        value.customer_id = left_key.to_string();
        value.product_sku = right_key.to_string();
        Ok(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
}

impl EventPayload for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
}

impl EventPayload for OrderShipped {
    const EVENT_TYPE: &'static str = "OrderShipped";
}

pub fn fast_config() -> OntologyConfig {
    OntologyConfig {
        event_poll_interval_ms: 10,
        event_backoff_base_ms: 5,
        event_backoff_max_ms: 20,
        event_max_attempts: 3,
        session_heartbeat_interval_ms: 50,
        ..OntologyConfig::default()
    }
}

pub fn ontology_with(config: OntologyConfig) -> Arc<Ontology> {
    let backend = Arc::new(SqliteStore::open(":memory:", config.clone()).unwrap());
    let ontology = OntologyBuilder::new(backend, config)
        .register_entity::<Customer>()
        .unwrap()
        .register_entity::<Product>()
        .unwrap()
        .register_relation::<Purchased>()
        .unwrap()
        .register_relation::<Wishlisted>()
        .unwrap()
        .build();
    Arc::new(ontology)
}

pub fn ontology() -> Arc<Ontology> {
    ontology_with(fast_config())
}

pub fn session(ontology: &Arc<Ontology>) -> Session {
    Session::new(Arc::clone(ontology), None)
}

pub fn customer(id: &str, name: &str, age: i64) -> Customer {
    Customer { id: id.to_string(), name: name.to_string(), age, email: None }
}
