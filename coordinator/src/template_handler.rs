//! Tag-to-template matching and tag-compatibility computation (spec §4.5),
//! ported 1:1 from `template_handler.py`.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::model::{Tag, Template};
use crate::store::Store;

/// Resolves tag names to [`Tag`] rows, keeping one output slot per input
/// name — even when unmatched — since callers tolerate holes rather than
/// a filtered, shorter list.
pub async fn get_tags_by_string(store: &Arc<dyn Store>, names: &[String]) -> Vec<Option<Tag>> {
    store.find_tags_by_names(names).await
}

pub async fn get_tags_containing_string_anycase(store: &Arc<dyn Store>, substr: &str) -> Vec<Tag> {
    store.tags_containing(substr).await
}

/// For every template whose tag set is a superset of `tags`, unions all
/// its remaining tags and returns that union minus `tags` — drives
/// progressive tag selection in a UI.
pub async fn get_tags_compatible_with_tags(store: &Arc<dyn Store>, tags: &[Uuid]) -> Vec<Tag> {
    let requested: HashSet<Uuid> = tags.iter().copied().collect();
    let templates = store.list_templates().await;
    let all_tags = store.list_tags().await;

    let mut compatible_ids: HashSet<Uuid> = HashSet::new();
    for template in &templates {
        if requested.is_subset(&template.tags) {
            compatible_ids.extend(template.tags.iter().copied());
        }
    }
    compatible_ids.retain(|id| !requested.contains(id));

    all_tags
        .into_iter()
        .filter(|t| compatible_ids.contains(&t.id))
        .collect()
}

/// First template whose tag set is a superset of `tags`, in store order.
pub fn find_matching_template<'a>(templates: &'a [Template], tags: &HashSet<Uuid>) -> Option<&'a Template> {
    templates.iter().find(|t| tags.is_subset(&t.tags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceMap;
    use crate::store::MemoryStore;

    fn template_with_tags(tags: HashSet<Uuid>) -> Template {
        Template {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            internal_name: "t-internal".to_string(),
            description: String::new(),
            allowed_engine_types: HashSet::new(),
            tags,
            resource_requirements: ResourceMap::new(),
        }
    }

    #[test]
    fn matches_first_superset_template() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let needed: HashSet<Uuid> = [a].into_iter().collect();

        let t1 = template_with_tags([b].into_iter().collect());
        let t2 = template_with_tags([a, b].into_iter().collect());
        let templates = vec![t1.clone(), t2.clone()];

        let found = find_matching_template(&templates, &needed).unwrap();
        assert_eq!(found.id, t2.id);
    }

    #[tokio::test]
    async fn compatible_tags_excludes_requested_set() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a = store.create_tag("gpu").await;
        let b = store.create_tag("windows").await;
        let c = store.create_tag("linux").await;

        let tags: HashSet<Uuid> = [a.id, b.id].into_iter().collect();
        store.create_template(template_with_tags(tags)).await;
        let other_tags: HashSet<Uuid> = [a.id, c.id].into_iter().collect();
        store.create_template(template_with_tags(other_tags)).await;

        let compatible = get_tags_compatible_with_tags(&store, &[a.id]).await;
        let ids: HashSet<Uuid> = compatible.iter().map(|t| t.id).collect();

        assert!(ids.contains(&b.id));
        assert!(ids.contains(&c.id));
        assert!(!ids.contains(&a.id));
    }
}
