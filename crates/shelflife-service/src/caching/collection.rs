use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value that can be held by a [`Cacher`](super::Cacher).
///
/// Values are cloned out of memory on every hit and written to snapshots as JSON. An empty
/// collection is never restored from a snapshot, as it is indistinguishable from a failed export.
pub trait Collection: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The number of items in the collection.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Collection for Vec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn len(&self) -> usize {
        Vec::len(self)
    }
}

impl<K, V> Collection for BTreeMap<K, V>
where
    K: Serialize + DeserializeOwned + Ord + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
}

impl<K, V, S> Collection for HashMap<K, V, S>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: BuildHasher + Default + Clone + Send + Sync + 'static,
{
    fn len(&self) -> usize {
        HashMap::len(self)
    }
}

/// Untyped JSON documents.
///
/// `null` is empty, arrays and objects count their elements and any other scalar is a single item.
impl Collection for serde_json::Value {
    fn len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Array(items) => items.len(),
            Self::Object(fields) => fields.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_len() {
        assert!(Collection::is_empty(&json!(null)));
        assert!(Collection::is_empty(&json!([])));
        assert!(Collection::is_empty(&json!({})));
        assert_eq!(Collection::len(&json!([{"id": "a"}, {"id": "b"}])), 2);
        assert_eq!(Collection::len(&json!({"a": 1})), 1);
        assert_eq!(Collection::len(&json!("org")), 1);
    }

    #[test]
    fn test_maps() {
        let mut map = BTreeMap::new();
        assert!(Collection::is_empty(&map));
        map.insert("a".to_owned(), 1u32);
        assert_eq!(Collection::len(&map), 1);

        let map: HashMap<String, Vec<u32>> = [("a".to_owned(), vec![])].into();
        assert_eq!(Collection::len(&map), 1);
    }
}
