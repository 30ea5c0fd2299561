use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::registry::{Entity, Identity, IdentityRegistry, RegistryError};

/// The reserved view used by snapshots. Sees every persisted field regardless of restrictions.
pub const WILDCARD_VIEW: &str = "*";

/// The view named by a restriction that does not spell out a view name.
pub const DEFAULT_VIEW: &str = "";

/// ViewError
///
/// Failures while converting an entity to or from its wire representation.
/// All of these surface as `INTERNAL` when they happen inside a request.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("field `{field}` of {entity}: {source}")]
    Field {
        entity: &'static str,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{entity} must be encoded as a JSON object")]
    NotAnObject { entity: &'static str },
    #[error("malformed registry of {entity}: {reason}")]
    MalformedRegistry { entity: &'static str, reason: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("the `*` view is reserved for snapshots")]
    ReservedView,
}

/// Visibility
///
/// Where a persisted field shows up. `Everywhere` is the unannotated case; `Only` lists the named
/// views the field is restricted to. The wildcard view bypasses `Only`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Everywhere,
    Only(BTreeSet<String>),
}

impl Visibility {
    pub fn admits(&self, view: &str) -> bool {
        match self {
            Visibility::Everywhere => true,
            Visibility::Only(views) => view == WILDCARD_VIEW || views.contains(view),
        }
    }
}

type EncodeFn<E> = Box<dyn Fn(&E, &str) -> Result<Value, ViewError> + Send + Sync>;
type DecodeFn<E> = Box<dyn Fn(&mut E, Value, &str) -> Result<(), ViewError> + Send + Sync>;

struct FieldSlot<E> {
    name: &'static str,
    visibility: Visibility,
    encode: EncodeFn<E>,
    decode: DecodeFn<E>,
}

/// SerializationProfile
///
/// The per-type field table consulted by `encode` and `decode`: one slot per persisted field with
/// its accessor, its mutator and its view restriction. Built once per type through
/// `ProfileBuilder` and cached by the type's `Persistent::profile`.
pub struct SerializationProfile<E> {
    entity: &'static str,
    fields: Vec<FieldSlot<E>>,
}

impl<E: 'static> SerializationProfile<E> {
    pub fn builder(entity: &'static str) -> ProfileBuilder<E> {
        ProfileBuilder {
            entity,
            fields: Vec::new(),
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Names of every persisted field, in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|slot| slot.name)
    }

    pub fn visibility(&self, field: &str) -> Option<&Visibility> {
        self.fields
            .iter()
            .find(|slot| slot.name == field)
            .map(|slot| &slot.visibility)
    }

    /// Whether `field` is persisted and visible under `view`.
    pub fn is_visible(&self, field: &str, view: &str) -> bool {
        self.visibility(field).is_some_and(|v| v.admits(view))
    }
}

/// ProfileBuilder
///
/// Declares the persisted fields of an entity type. Fields not declared here are never encoded.
pub struct ProfileBuilder<E> {
    entity: &'static str,
    fields: Vec<FieldSlot<E>>,
}

fn restriction(views: &[&str]) -> Visibility {
    if views.is_empty() {
        return Visibility::Only(BTreeSet::from([DEFAULT_VIEW.to_string()]));
    }
    Visibility::Only(views.iter().map(|v| v.to_string()).collect())
}

impl<E: 'static> ProfileBuilder<E> {
    /// An unrestricted field, visible in every view.
    pub fn field<T>(self, name: &'static str, get: fn(&E) -> &T, get_mut: fn(&mut E) -> &mut T) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.plain(name, Visibility::Everywhere, get, get_mut)
    }

    /// A field visible only in `views` (and the wildcard view). An empty list names the default view.
    pub fn field_in<T>(
        self,
        name: &'static str,
        views: &[&str],
        get: fn(&E) -> &T,
        get_mut: fn(&mut E) -> &mut T,
    ) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.plain(name, restriction(views), get, get_mut)
    }

    /// A nested persistent value, encoded with its own profile under the same view.
    pub fn nested<T: Persistent>(
        mut self,
        name: &'static str,
        visibility: Visibility,
        get: fn(&E) -> &T,
        get_mut: fn(&mut E) -> &mut T,
    ) -> Self {
        self.fields.push(FieldSlot {
            name,
            visibility,
            encode: Box::new(move |entity, view| encode(get(entity), view)),
            decode: Box::new(move |entity, value, view| {
                *get_mut(entity) = decode(value, view)?;
                Ok(())
            }),
        });
        self
    }

    /// A nested registry, encoded as `{allocation, values}` with every value under the same view.
    pub fn registry<T: Persistent + Entity>(
        mut self,
        name: &'static str,
        visibility: Visibility,
        get: fn(&E) -> &IdentityRegistry<T>,
        get_mut: fn(&mut E) -> &mut IdentityRegistry<T>,
    ) -> Self {
        self.fields.push(FieldSlot {
            name,
            visibility,
            encode: Box::new(move |entity, view| encode_registry(get(entity), view)),
            decode: Box::new(move |entity, value, view| {
                *get_mut(entity) = decode_registry(value, view)?;
                Ok(())
            }),
        });
        self
    }

    pub fn build(self) -> SerializationProfile<E> {
        SerializationProfile {
            entity: self.entity,
            fields: self.fields,
        }
    }

    fn plain<T>(
        mut self,
        name: &'static str,
        visibility: Visibility,
        get: fn(&E) -> &T,
        get_mut: fn(&mut E) -> &mut T,
    ) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let entity = self.entity;
        self.fields.push(FieldSlot {
            name,
            visibility,
            encode: Box::new(move |value, _| {
                serde_json::to_value(get(value)).map_err(|source| ViewError::Field {
                    entity,
                    field: name,
                    source,
                })
            }),
            decode: Box::new(move |target, value, _| {
                *get_mut(target) =
                    serde_json::from_value(value).map_err(|source| ViewError::Field {
                        entity,
                        field: name,
                        source,
                    })?;
                Ok(())
            }),
        });
        self
    }
}

/// Persistent
///
/// Implemented by every type that can be rendered through views. `NAME` identifies the type in
/// error messages and snapshot file names; `profile` returns the cached field table.
pub trait Persistent: Default + Send + Sync + Sized + 'static {
    const NAME: &'static str;

    fn profile() -> &'static SerializationProfile<Self>;
}

/// encode
///
/// Renders `entity` with only the fields visible under `view`.
pub fn encode<E: Persistent>(entity: &E, view: &str) -> Result<Value, ViewError> {
    let profile = E::profile();
    let mut object = Map::new();
    for slot in profile.fields.iter().filter(|slot| slot.visibility.admits(view)) {
        object.insert(slot.name.to_string(), (slot.encode)(entity, view)?);
    }
    Ok(Value::Object(object))
}

/// decode
///
/// Builds an entity from its wire form. Only fields visible under `view` are read; everything else,
/// including omitted and `null` fields, keeps the type's default value. Unknown keys are ignored.
pub fn decode<E: Persistent>(value: Value, view: &str) -> Result<E, ViewError> {
    let profile = E::profile();
    let Value::Object(mut object) = value else {
        return Err(ViewError::NotAnObject { entity: E::NAME });
    };
    let mut entity = E::default();
    for slot in profile.fields.iter().filter(|slot| slot.visibility.admits(view)) {
        match object.remove(slot.name) {
            None | Some(Value::Null) => {}
            Some(field) => (slot.decode)(&mut entity, field, view)?,
        }
    }
    Ok(entity)
}

/// Encodes a registry as `{ "allocation": n, "values": [...] }`, each value under `view`.
pub fn encode_registry<E: Persistent + Entity>(
    registry: &IdentityRegistry<E>,
    view: &str,
) -> Result<Value, ViewError> {
    let (allocation, records) = registry.snapshot();
    let mut values = Vec::with_capacity(records.len());
    for record in records {
        values.push(encode(&*record.read(), view)?);
    }
    Ok(json!({ "allocation": allocation, "values": values }))
}

/// decode_registry
///
/// Rebuilds a registry from its wire form. The bijection is rebuilt from `values` using the identity
/// stored in each value; duplicate identities reject the whole registry.
pub fn decode_registry<E: Persistent + Entity>(
    value: Value,
    view: &str,
) -> Result<IdentityRegistry<E>, ViewError> {
    let malformed = |reason: &str| ViewError::MalformedRegistry {
        entity: E::NAME,
        reason: reason.to_string(),
    };
    let Value::Object(mut object) = value else {
        return Err(malformed("expected an object"));
    };
    let allocation: Identity = match object.remove("allocation") {
        None | Some(Value::Null) => 0,
        Some(raw) => raw
            .as_u64()
            .ok_or_else(|| malformed("`allocation` must be an unsigned integer"))?,
    };
    let values = match object.remove("values") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values,
        Some(_) => return Err(malformed("`values` must be an array")),
    };
    let entities = values
        .into_iter()
        .map(|value| decode::<E>(value, view))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(IdentityRegistry::restore(allocation, entities)?)
}
