//! Typed query coordinator.
//!
//! Entry points return ordered, materialized sequences of typed values
//! with `meta()` records. Relation queries hydrate their endpoints under
//! the same temporal window; traversals walk relation steps, picking the
//! side whose declared entity type matches the incoming step.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use ontograph_core::{
    EntityModel, Filter, Hydrated, Meta, OntoError, RelationModel, Result, TypeName,
};
use ontograph_store::{
    AggFunc, AggSpec, EndpointTypes, Having, OntoBackend, QuerySpec, ReadWindow, RelationRow,
    TraversalSide,
};

/// Entry point for building typed queries.
#[derive(Clone)]
pub struct QueryBuilder {
    backend: Arc<dyn OntoBackend>,
    version_ids: BTreeMap<TypeName, u32>,
}

impl QueryBuilder {
    pub fn new(backend: Arc<dyn OntoBackend>, version_ids: BTreeMap<TypeName, u32>) -> Self {
        QueryBuilder { backend, version_ids }
    }

    pub fn entities<E: EntityModel>(&self) -> EntityQuery<E> {
        let svid = self
            .version_ids
            .get(&TypeName::entity(E::entity_name()))
            .copied();
        EntityQuery {
            backend: Arc::clone(&self.backend),
            spec: QuerySpec { schema_version_id: svid, ..QuerySpec::default() },
            _marker: PhantomData,
        }
    }

    pub fn relations<R: RelationModel>(&self) -> RelationQuery<R> {
        let svid = self
            .version_ids
            .get(&TypeName::relation(R::relation_name()))
            .copied();
        RelationQuery {
            backend: Arc::clone(&self.backend),
            spec: QuerySpec { schema_version_id: svid, ..QuerySpec::default() },
            _marker: PhantomData,
        }
    }
}

fn merge_filter(existing: &mut Option<Filter>, extra: Filter) {
    *existing = Some(match existing.take() {
        Some(current) => current.and(extra),
        None => extra,
    });
}

/// Lazy, restartable query over one entity type.
pub struct EntityQuery<E: EntityModel> {
    backend: Arc<dyn OntoBackend>,
    spec: QuerySpec,
    _marker: PhantomData<E>,
}

impl<E: EntityModel> EntityQuery<E> {
    pub fn where_(mut self, filter: Filter) -> Self {
        merge_filter(&mut self.spec.filter, filter);
        self
    }

    pub fn order_by(mut self, field_name: &str) -> Self {
        self.spec.order_by = Some(field_name.to_string());
        self.spec.order_desc = false;
        self
    }

    pub fn order_by_desc(mut self, field_name: &str) -> Self {
        self.spec.order_by = Some(field_name.to_string());
        self.spec.order_desc = true;
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.spec.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.spec.offset = Some(n);
        self
    }

    pub fn as_of(mut self, commit_id: u64) -> Self {
        self.spec.window = ReadWindow::AsOf(commit_id);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.spec.window = ReadWindow::WithHistory;
        self
    }

    pub fn history_since(mut self, commit_id: u64) -> Self {
        self.spec.window = ReadWindow::HistorySince(commit_id);
        self
    }

    pub async fn collect(&self) -> Result<Vec<Hydrated<E>>> {
        let rows = self.backend.query_entities(E::entity_name(), &self.spec).await?;
        rows.into_iter()
            .map(|row| {
                let value = E::from_fields(&row.fields)?;
                Ok(Hydrated::new(
                    value,
                    Meta::entity(row.commit_id, E::entity_name(), row.key),
                ))
            })
            .collect()
    }

    pub async fn first(mut self) -> Result<Option<Hydrated<E>>> {
        self.spec.limit = Some(1);
        Ok(self.collect().await?.into_iter().next())
    }

    pub async fn count(&self) -> Result<u64> {
        self.backend
            .count_entities(E::entity_name(), self.spec.filter.as_ref())
            .await
    }

    async fn aggregate(&self, func: AggFunc, field_name: &str) -> Result<Value> {
        self.backend
            .aggregate_entities(E::entity_name(), func, field_name, self.spec.filter.as_ref())
            .await
    }

    pub async fn sum(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Sum, field_name).await
    }

    pub async fn avg(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Avg, field_name).await
    }

    pub async fn min(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Min, field_name).await
    }

    pub async fn max(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Max, field_name).await
    }

    /// Average of `length(list_field)`; NULL excluded, `[]` counts as 0.
    pub async fn avg_len(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::AvgLen, field_name).await
    }

    /// Count rows matching the current filter plus an extra predicate.
    pub async fn count_where(&self, predicate: Filter) -> Result<u64> {
        let combined = match &self.spec.filter {
            Some(current) => current.clone().and(predicate),
            None => predicate,
        };
        self.backend.count_entities(E::entity_name(), Some(&combined)).await
    }

    pub fn group_by(self, field_name: &str) -> GroupedQuery {
        GroupedQuery {
            backend: self.backend,
            target: GroupTarget::Entity(E::entity_name().to_string()),
            group_field: field_name.to_string(),
            filter: self.spec.filter,
            having: None,
        }
    }

    /// Start a relation traversal from the entities this query matches.
    pub fn via<R: RelationModel>(self) -> TraversalQuery<E> {
        TraversalQuery {
            backend: self.backend,
            source_filter: self.spec.filter,
            steps: vec![TraversalStep::of::<R>()],
            _marker: PhantomData,
        }
    }
}

/// A hydrated relation with its endpoints resolved.
pub struct RelationMatch<R: RelationModel> {
    pub relation: R,
    meta: Meta,
    pub left: Option<Hydrated<R::Left>>,
    pub right: Option<Hydrated<R::Right>>,
}

impl<R: RelationModel> RelationMatch<R> {
    pub fn meta(&self) -> &Meta {
        &self.meta
    }
}

/// Lazy, restartable query over one relation type.
pub struct RelationQuery<R: RelationModel> {
    backend: Arc<dyn OntoBackend>,
    spec: QuerySpec,
    _marker: PhantomData<R>,
}

impl<R: RelationModel> RelationQuery<R> {
    fn endpoints() -> EndpointTypes {
        EndpointTypes::new(R::Left::entity_name(), R::Right::entity_name())
    }

    pub fn where_(mut self, filter: Filter) -> Self {
        merge_filter(&mut self.spec.filter, filter);
        self
    }

    pub fn order_by(mut self, field_name: &str) -> Self {
        self.spec.order_by = Some(field_name.to_string());
        self.spec.order_desc = false;
        self
    }

    pub fn order_by_desc(mut self, field_name: &str) -> Self {
        self.spec.order_by = Some(field_name.to_string());
        self.spec.order_desc = true;
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.spec.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.spec.offset = Some(n);
        self
    }

    pub fn as_of(mut self, commit_id: u64) -> Self {
        self.spec.window = ReadWindow::AsOf(commit_id);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.spec.window = ReadWindow::WithHistory;
        self
    }

    pub fn history_since(mut self, commit_id: u64) -> Self {
        self.spec.window = ReadWindow::HistorySince(commit_id);
        self
    }

    pub async fn collect(&self) -> Result<Vec<RelationMatch<R>>> {
        let rows = self
            .backend
            .query_relations(R::relation_name(), &Self::endpoints(), &self.spec)
            .await?;

        // Endpoint hydration honors the same temporal window as the
        // relation read.
        let endpoint_window = match self.spec.window {
            ReadWindow::AsOf(c) => ReadWindow::AsOf(c),
            _ => ReadWindow::Latest,
        };
        let left_rows = self
            .backend
            .query_entities(
                R::Left::entity_name(),
                &QuerySpec { window: endpoint_window, ..QuerySpec::default() },
            )
            .await?;
        let right_rows = self
            .backend
            .query_entities(
                R::Right::entity_name(),
                &QuerySpec { window: endpoint_window, ..QuerySpec::default() },
            )
            .await?;
        let left_map: BTreeMap<String, (Map<String, Value>, u64)> = left_rows
            .into_iter()
            .map(|r| (r.key, (r.fields, r.commit_id)))
            .collect();
        let right_map: BTreeMap<String, (Map<String, Value>, u64)> = right_rows
            .into_iter()
            .map(|r| (r.key, (r.fields, r.commit_id)))
            .collect();

        let mut out = Vec::new();
        for row in rows {
            let relation =
                R::from_row(&row.left_key, &row.right_key, &row.instance_key, &row.fields)?;
            let instance_key =
                (!row.instance_key.is_empty()).then(|| row.instance_key.clone());
            let meta = Meta::relation(
                row.commit_id,
                R::relation_name(),
                row.left_key.clone(),
                row.right_key.clone(),
                instance_key,
            );
            let left = match left_map.get(&row.left_key) {
                Some((fields, commit_id)) => Some(Hydrated::new(
                    R::Left::from_fields(fields)?,
                    Meta::entity(*commit_id, R::Left::entity_name(), row.left_key.clone()),
                )),
                None => None,
            };
            let right = match right_map.get(&row.right_key) {
                Some((fields, commit_id)) => Some(Hydrated::new(
                    R::Right::from_fields(fields)?,
                    Meta::entity(*commit_id, R::Right::entity_name(), row.right_key.clone()),
                )),
                None => None,
            };
            out.push(RelationMatch { relation, meta, left, right });
        }
        Ok(out)
    }

    pub async fn first(mut self) -> Result<Option<RelationMatch<R>>> {
        self.spec.limit = Some(1);
        Ok(self.collect().await?.into_iter().next())
    }

    pub async fn count(&self) -> Result<u64> {
        self.backend
            .count_relations(R::relation_name(), &Self::endpoints(), self.spec.filter.as_ref())
            .await
    }

    /// Count relations matching the current filter plus an existential
    /// predicate.
    pub async fn count_where(&self, predicate: Filter) -> Result<u64> {
        let combined = match &self.spec.filter {
            Some(current) => current.clone().and(predicate),
            None => predicate,
        };
        self.backend
            .count_relations(R::relation_name(), &Self::endpoints(), Some(&combined))
            .await
    }

    async fn aggregate(&self, func: AggFunc, field_name: &str) -> Result<Value> {
        self.backend
            .aggregate_relations(R::relation_name(), func, field_name, self.spec.filter.as_ref())
            .await
    }

    pub async fn sum(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Sum, field_name).await
    }

    pub async fn avg(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Avg, field_name).await
    }

    pub async fn min(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Min, field_name).await
    }

    pub async fn max(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::Max, field_name).await
    }

    pub async fn avg_len(&self, field_name: &str) -> Result<Value> {
        self.aggregate(AggFunc::AvgLen, field_name).await
    }

    /// Group by a relation field, or an endpoint field via `left.$.F` /
    /// `right.$.F`.
    pub fn group_by(self, field_name: &str) -> GroupedQuery {
        GroupedQuery {
            backend: self.backend,
            target: GroupTarget::Relation {
                type_name: R::relation_name().to_string(),
                endpoints: Self::endpoints(),
            },
            group_field: field_name.to_string(),
            filter: self.spec.filter,
            having: None,
        }
    }
}

enum GroupTarget {
    Entity(String),
    Relation { type_name: String, endpoints: EndpointTypes },
}

/// Group-by with aliased aggregations and an optional HAVING comparison.
pub struct GroupedQuery {
    backend: Arc<dyn OntoBackend>,
    target: GroupTarget,
    group_field: String,
    filter: Option<Filter>,
    having: Option<Having>,
}

impl GroupedQuery {
    pub fn having(mut self, having: Having) -> Self {
        self.having = Some(having);
        self
    }

    /// Execute the grouping; each record carries the group field plus one
    /// key per aggregation alias.
    pub async fn agg(&self, aggs: &[AggSpec]) -> Result<Vec<Map<String, Value>>> {
        match &self.target {
            GroupTarget::Entity(type_name) => {
                self.backend
                    .group_by_entities(
                        type_name,
                        &self.group_field,
                        aggs,
                        self.filter.as_ref(),
                        self.having.as_ref(),
                    )
                    .await
            }
            GroupTarget::Relation { type_name, endpoints } => {
                self.backend
                    .group_by_relations(
                        type_name,
                        &self.group_field,
                        aggs,
                        endpoints,
                        self.filter.as_ref(),
                        self.having.as_ref(),
                    )
                    .await
            }
        }
    }
}

#[derive(Debug, Clone)]
struct TraversalStep {
    relation: String,
    left_type: String,
    right_type: String,
}

impl TraversalStep {
    fn of<R: RelationModel>() -> Self {
        TraversalStep {
            relation: R::relation_name().to_string(),
            left_type: R::Left::entity_name().to_string(),
            right_type: R::Right::entity_name().to_string(),
        }
    }
}

/// One relation hop inside a traversal path.
#[derive(Debug, Clone)]
pub struct RelationHop {
    pub step: usize,
    pub relation_type: String,
    pub row: RelationRow,
}

/// A dynamically-typed entity node reached by a traversal.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub step: usize,
    pub type_name: String,
    pub key: String,
    pub fields: Map<String, Value>,
    pub commit_id: u64,
}

impl EntityNode {
    /// Decode into a typed entity; fails when the node is another type.
    pub fn decode<E: EntityModel>(&self) -> Result<Hydrated<E>> {
        if self.type_name != E::entity_name() {
            return Err(OntoError::Model(format!(
                "node is a '{}', not a '{}'",
                self.type_name,
                E::entity_name()
            )));
        }
        Ok(Hydrated::new(
            E::from_fields(&self.fields)?,
            Meta::entity(self.commit_id, self.type_name.clone(), self.key.clone()),
        ))
    }
}

/// One source entity plus the relations and entities reached from it.
pub struct TraversalPath<S: EntityModel> {
    pub source: Hydrated<S>,
    pub relations: Vec<RelationHop>,
    pub entities: Vec<EntityNode>,
}

/// Multi-step relation traversal. Each `via` is one step; cycles are
/// allowed and paths do not compute transitive closure.
pub struct TraversalQuery<S: EntityModel> {
    backend: Arc<dyn OntoBackend>,
    source_filter: Option<Filter>,
    steps: Vec<TraversalStep>,
    _marker: PhantomData<S>,
}

impl<S: EntityModel> TraversalQuery<S> {
    pub fn via<R: RelationModel>(mut self) -> Self {
        self.steps.push(TraversalStep::of::<R>());
        self
    }

    pub fn where_(mut self, filter: Filter) -> Self {
        merge_filter(&mut self.source_filter, filter);
        self
    }

    pub async fn collect(&self) -> Result<Vec<TraversalPath<S>>> {
        let source_rows = self
            .backend
            .query_entities(
                S::entity_name(),
                &QuerySpec { filter: self.source_filter.clone(), ..QuerySpec::default() },
            )
            .await?;

        let mut paths = Vec::new();
        for src in source_rows {
            let source = Hydrated::new(
                S::from_fields(&src.fields)?,
                Meta::entity(src.commit_id, S::entity_name(), src.key.clone()),
            );

            let mut relations = Vec::new();
            let mut entities = Vec::new();
            let mut current_keys = vec![src.key.clone()];
            let mut current_type = S::entity_name().to_string();

            for (step_index, step) in self.steps.iter().enumerate() {
                // Follow the side whose declared type matches the incoming
                // entity type; left wins for self-relations.
                let (side, far_type) = if step.left_type == current_type {
                    (TraversalSide::Left, step.right_type.clone())
                } else if step.right_type == current_type {
                    (TraversalSide::Right, step.left_type.clone())
                } else {
                    return Err(OntoError::Filter(format!(
                        "relation '{}' does not connect entity type '{}'",
                        step.relation, current_type
                    )));
                };

                let mut next_keys = Vec::new();
                for key in &current_keys {
                    let rows = self
                        .backend
                        .get_relations_for_entity(&step.relation, key, side)
                        .await?;
                    for row in rows {
                        let far_key = match side {
                            TraversalSide::Left => row.right_key.clone(),
                            TraversalSide::Right => row.left_key.clone(),
                        };
                        relations.push(RelationHop {
                            step: step_index,
                            relation_type: step.relation.clone(),
                            row,
                        });
                        if let Some(far) =
                            self.backend.get_latest_entity(&far_type, &far_key).await?
                        {
                            entities.push(EntityNode {
                                step: step_index,
                                type_name: far_type.clone(),
                                key: far.key,
                                fields: far.fields,
                                commit_id: far.commit_id,
                            });
                        }
                        next_keys.push(far_key);
                    }
                }
                current_keys = next_keys;
                current_type = far_type;
            }

            paths.push(TraversalPath { source, relations, entities });
        }
        Ok(paths)
    }

    /// Flatten to the reached entities, deduplicating per traversal step
    /// by entity identity.
    pub async fn without_relations(&self) -> Result<Vec<EntityNode>> {
        let paths = self.collect().await?;
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for path in paths {
            for node in path.entities {
                if seen.insert((node.step, node.type_name.clone(), node.key.clone())) {
                    out.push(node);
                }
            }
        }
        Ok(out)
    }
}
