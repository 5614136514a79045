//! End-to-end tests for scanning, searching and purging the policy cache

mod common;

use common::{cultures, ids, open_cache, portable, PolicyTree};
use policy_cache::{CultureOutcome, SearchFields, SearchRequest};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn request(query: &str, list: &[&str]) -> SearchRequest {
    SearchRequest::new(query, cultures(list))
}

fn ids_of(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn test_full_workflow() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();

    let report = cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();
    assert!(report.global_rebuild);
    assert!(matches!(
        report.outcome("en-US"),
        Some(CultureOutcome::Reparsed { policies: 5, .. })
    ));

    let hits = cache.search(request("pop-ups", &["en-US"]), &cancel).await.unwrap();
    assert_eq!(hits[0].unique_id, "Contoso.Browser:BlockPopups");
    assert_eq!(hits[0].display_name, "Block pop-ups");
    assert_eq!(hits[0].culture, "en-US");

    let detail = cache
        .get_by_policy_name("Contoso.Browser", "HomePage", &cultures(&["en-US"]), &cancel)
        .await
        .unwrap()
        .expect("HomePage is indexed");
    assert_eq!(detail.display_name, "Set the home page");
    assert_eq!(detail.value_type, "Text");
    assert_eq!(detail.hive, "User");
}

#[tokio::test]
async fn test_rescan_is_idempotent() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    let list = cultures(&["en-US", "de-DE"]);

    cache.scan_and_update(&list, &cancel).await.unwrap();
    let first_hits = cache.search(request("contoso", &["en-US"]), &cancel).await.unwrap();
    let first_detail = cache
        .get_by_policy_name("Contoso.Browser", "BlockPopups", &list, &cancel)
        .await
        .unwrap();

    let report = cache.scan_and_update(&list, &cancel).await.unwrap();
    assert_eq!(report.outcome("en-US"), Some(&CultureOutcome::Unchanged));
    assert_eq!(report.outcome("de-DE"), Some(&CultureOutcome::Unchanged));

    let second_hits = cache.search(request("contoso", &["en-US"]), &cancel).await.unwrap();
    let second_detail = cache
        .get_by_policy_name("Contoso.Browser", "BlockPopups", &list, &cancel)
        .await
        .unwrap();

    assert_eq!(ids(&first_hits), ids(&second_hits));
    assert_eq!(first_hits, second_hits);
    assert!(first_detail.is_some());
    assert_eq!(first_detail, second_detail);
}

#[tokio::test]
async fn test_culture_order_does_not_change_content() {
    let tree = PolicyTree::new();
    let cancel = CancellationToken::new();

    let forward = open_cache(tree.config("forward"), tree.path()).await;
    forward
        .scan_and_update(&cultures(&["en-US", "de-DE"]), &cancel)
        .await
        .unwrap();
    let backward = open_cache(tree.config("backward"), tree.path()).await;
    backward
        .scan_and_update(&cultures(&["de-DE", "en-US"]), &cancel)
        .await
        .unwrap();

    let (a, b) = (forward.stats().unwrap(), backward.stats().unwrap());
    assert_eq!(a.localizations_by_culture, b.localizations_by_culture);
    assert_eq!(a.index_entries, b.index_entries);

    for (query, list) in [
        ("contoso", &["de-DE", "en-US"][..]),
        ("update", &["en-US"][..]),
        ("blockieren", &["de-DE"][..]),
    ] {
        let x = forward.search(request(query, list), &cancel).await.unwrap();
        let y = backward.search(request(query, list), &cancel).await.unwrap();
        assert!(!x.is_empty(), "no hits for {}", query);
        assert_eq!(portable(&x), portable(&y), "query {}", query);
    }
}

#[tokio::test]
async fn test_and_mode_requires_every_token() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();

    let present = cache.search(request("popups", &["en-US"]), &cancel).await.unwrap();
    assert!(ids(&present).contains("Contoso.Browser:BlockPopups"));

    let and_hits = cache
        .search(request("popups zzqxjv", &["en-US"]).and_mode(true), &cancel)
        .await
        .unwrap();
    assert!(and_hits.is_empty());

    let or_hits = cache
        .search(request("popups zzqxjv", &["en-US"]), &cancel)
        .await
        .unwrap();
    assert_eq!(ids(&or_hits), ids(&present));
}

#[tokio::test]
async fn test_or_mode_keeps_near_matches_of_present_words() {
    let tree = PolicyTree::new();
    tree.write_definition(
        "tick.admx",
        &json!({
            "namespace": "Tick.Clock",
            "policies": [{
                "name": "ClockSync",
                "class": "Machine",
                "display_name": "$(string.ClockSync)",
                "key": "Software\\Policies\\Tick",
                "value_name": "Sync"
            }]
        }),
    );
    tree.write_localization("en-US", "tick.adml", &[("ClockSync", "Clock settings")]);

    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();

    let single = cache.search(request("block", &["en-US"]), &cancel).await.unwrap();
    let single_ids = ids(&single);
    assert!(single_ids.contains("Contoso.Browser:BlockPopups"));
    assert!(single_ids.contains("Tick.Clock:ClockSync"));

    // A word found nowhere changes nothing in OR mode
    let with_noise = cache
        .search(request("block zzqxjv", &["en-US"]), &cancel)
        .await
        .unwrap();
    assert_eq!(ids(&with_noise), single_ids);

    let and_hits = cache
        .search(request("block zzqxjv", &["en-US"]).and_mode(true), &cancel)
        .await
        .unwrap();
    assert!(and_hits.is_empty());
}

#[tokio::test]
async fn test_unbounded_limit_matches_default() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();

    let default = cache.search(request("contoso", &["en-US"]), &cancel).await.unwrap();
    let unbounded = cache
        .search(request("contoso", &["en-US"]).limit(usize::MAX), &cancel)
        .await
        .unwrap();
    assert_eq!(default.len(), 3);
    assert_eq!(portable(&unbounded), portable(&default));
}

#[tokio::test]
async fn test_other_cultures_do_not_crowd_out_requested_rows() {
    let tree = PolicyTree::new();
    let names: Vec<String> = (0..260).map(|i| format!("Widget{}", i)).collect();
    let policies: Vec<_> = names
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "class": "Machine",
                "display_name": format!("$(string.{})", name),
                "key": "Software\\Policies\\Acme",
                "value_name": name
            })
        })
        .collect();
    tree.write_definition(
        "acme.admx",
        &json!({ "namespace": "Acme.Widgets", "policies": policies }),
    );

    let short_titles: Vec<(String, String)> = names
        .iter()
        .map(|name| (name.clone(), format!("Gear {}", name)))
        .collect();
    let short_refs: Vec<(&str, &str)> = short_titles
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    tree.write_localization("xx-XX", "acme.adml", &short_refs);
    // Long title ranks below every short one
    tree.write_localization(
        "en-US",
        "acme.adml",
        &[(
            "Widget0",
            "Gear assembly tuning for the outer housing of the primary drive train and its spare parts",
        )],
    );

    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US", "xx-XX"]), &cancel)
        .await
        .unwrap();

    // limit 5 fetches 200 candidates per pass, fewer than the xx-XX matches
    let hits = cache
        .search(request("gear", &["en-US"]).limit(5), &cancel)
        .await
        .unwrap();
    assert_eq!(ids(&hits), ids_of(&["Acme.Widgets:Widget0"]));
    assert_eq!(hits[0].culture, "en-US");
}

#[tokio::test]
async fn test_deleted_culture_directory_is_purged() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    let list = cultures(&["en-US", "de-DE"]);
    cache.scan_and_update(&list, &cancel).await.unwrap();

    let before = cache.search(request("blockieren", &["de-DE"]), &cancel).await.unwrap();
    assert_eq!(before.len(), 1);
    let english_before = cache.search(request("pop-ups", &["en-US"]), &cancel).await.unwrap();

    tree.remove_culture("de-DE");
    let report = cache.scan_and_update(&list, &cancel).await.unwrap();
    assert!(matches!(report.outcome("de-DE"), Some(CultureOutcome::Purged { removed: 2 })));
    assert_eq!(report.outcome("en-US"), Some(&CultureOutcome::Unchanged));

    let after = cache.search(request("blockieren", &["de-DE"]), &cancel).await.unwrap();
    assert!(after.is_empty());
    let english_after = cache.search(request("pop-ups", &["en-US"]), &cancel).await.unwrap();
    assert_eq!(english_before, english_after);

    let stats = cache.stats().unwrap();
    assert!(!stats.localizations_by_culture.contains_key("de-DE"));
    assert_eq!(stats.localizations_by_culture.get("en-US"), Some(&5));
}

#[tokio::test]
async fn test_primary_culture_wins_over_fallback() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US", "de-DE"]), &cancel)
        .await
        .unwrap();

    let hits = cache
        .search(request("contoso", &["de-DE", "en-US", "de-DE"]), &cancel)
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    for hit in &hits {
        match hit.unique_id.as_str() {
            // No German string for HomePage, so English surfaces
            "Contoso.Browser:HomePage" => assert_eq!(hit.culture, "en-US"),
            _ => assert_eq!(hit.culture, "de-DE", "{} surfaced in fallback", hit.unique_id),
        }
    }

    let detail = cache
        .get_by_policy_name("", "HomePage", &cultures(&["de-DE", "en-US"]), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.culture, "en-US");
}

#[tokio::test]
async fn test_second_culture_hit_survives_primary_row() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US", "de-DE"]), &cancel)
        .await
        .unwrap();

    // Only the German title matches; BlockPopups also has an English row
    let hits = cache
        .search(request("blockieren", &["en-US", "de-DE"]), &cancel)
        .await
        .unwrap();
    assert_eq!(ids(&hits), ids_of(&["Contoso.Browser:BlockPopups"]));
    assert_eq!(hits[0].culture, "de-DE");
}

#[tokio::test]
async fn test_later_culture_only_for_policies_missing_both_explicit_cultures() {
    let tree = PolicyTree::new();
    tree.write_localization(
        "fr-FR",
        "contoso.adml",
        &[
            ("BlockPopups", "Bloquer les fenêtres"),
            ("HomePage", "Page d'accueil"),
        ],
    );
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US", "de-DE", "fr-FR"]), &cancel)
        .await
        .unwrap();

    // es-ES is not indexed, so de-DE and es-ES are the explicit pair
    let list = ["de-DE", "es-ES", "fr-FR"];

    // HomePage has no German row
    let hits = cache.search(request("accueil", &list), &cancel).await.unwrap();
    assert_eq!(ids(&hits), ids_of(&["Contoso.Browser:HomePage"]));
    assert_eq!(hits[0].culture, "fr-FR");

    // BlockPopups has a German row, so the French match stays hidden
    let hits = cache.search(request("bloquer", &list), &cancel).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_allow_list_tracks_configured_files() {
    let tree = PolicyTree::new();
    let cancel = CancellationToken::new();
    let list = cultures(&["en-US"]);

    let scan_with = |pattern: &'static str| {
        let mut config = tree.config("cache");
        config.file_allow_list = vec![pattern.to_string()];
        let root = tree.path().to_path_buf();
        let cancel = cancel.clone();
        let list = list.clone();
        async move {
            let cache = open_cache(config, &root).await;
            cache.scan_and_update(&list, &cancel).await.unwrap();
            let contoso = cache.search(request("contoso", &["en-US"]), &cancel).await.unwrap();
            let fabrikam = cache.search(request("fabrikam", &["en-US"]), &cancel).await.unwrap();
            (contoso, fabrikam)
        }
    };

    let (contoso_a, fabrikam_a) = scan_with("contoso.admx").await;
    assert_eq!(contoso_a.len(), 3);
    assert!(fabrikam_a.is_empty());

    let (contoso_b, fabrikam_b) = scan_with("FABRIKAM.admx").await;
    assert!(contoso_b.is_empty());
    assert_eq!(fabrikam_b.len(), 2);

    let (contoso_again, fabrikam_again) = scan_with("contoso.*").await;
    assert!(fabrikam_again.is_empty());
    assert_eq!(portable(&contoso_again), portable(&contoso_a));
}

#[tokio::test]
async fn test_purge_removes_all_usage_and_rescan_restores_it() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    let list = cultures(&["en-US", "de-DE"]);
    cache.scan_and_update(&list, &cancel).await.unwrap();

    let usage = policy_cache::file_usage::FileUsageTracker::new(cache.store().clone());
    let before = usage.list().unwrap();
    // two definitions, two en-US and one de-DE localization
    assert_eq!(before.len(), 5);

    let removed = cache
        .purge_stale_cache_entries(Duration::ZERO, &cancel)
        .await
        .unwrap();
    assert_eq!(removed, before.len());
    assert_eq!(usage.count().unwrap(), 0);

    cache.scan_and_update(&list, &cancel).await.unwrap();
    let after = usage.list().unwrap();
    assert_eq!(after.len(), before.len());
    for row in &after {
        let old = before
            .iter()
            .find(|b| b.file_path == row.file_path)
            .expect("same files are tracked");
        assert!(row.last_access >= old.last_access);
    }
}

#[tokio::test]
async fn test_root_change_rebuilds_from_new_tree() {
    let first = PolicyTree::new();
    let second = PolicyTree::new();
    second.write_localization("en-US", "contoso.adml", &[("BlockPopups", "Stop pop-ups")]);

    let cache = open_cache(first.config("cache"), first.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US", "de-DE"]), &cancel)
        .await
        .unwrap();

    cache.set_source_root(second.path());
    let report = cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();
    assert!(report.global_rebuild);
    // de-DE is cached, so it is rebuilt even though only en-US was asked for
    assert!(matches!(report.outcome("de-DE"), Some(CultureOutcome::Reparsed { .. })));

    let hits = cache.search(request("stop pop-ups", &["en-US"]), &cancel).await.unwrap();
    assert_eq!(hits[0].display_name, "Stop pop-ups");
    let old = cache
        .search(
            request("block pop-ups", &["en-US"])
                .fields(SearchFields::NAME)
                .and_mode(true),
            &cancel,
        )
        .await
        .unwrap();
    assert!(old.is_empty());
}

#[tokio::test]
async fn test_registry_lookup_and_search() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();

    let detail = cache
        .get_by_registry_path(
            "HKLM\\Software\\Policies\\Contoso\\Browser\\Filter\\SmartScreenEnabled",
            &cultures(&["en-US"]),
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.policy_name, "SmartScreenFilter");

    // Wrong hive
    let none = cache
        .get_by_registry_path(
            "HKCU\\Software\\Policies\\Contoso\\Browser\\Filter\\SmartScreenEnabled",
            &cultures(&["en-US"]),
            &cancel,
        )
        .await
        .unwrap();
    assert!(none.is_none());

    let hits = cache
        .search(
            request("Software\\Policies\\Fabrikam\\Update\\Channel", &["en-US"]),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(hits[0].unique_id, "Fabrikam.Update:UpdateChannel");
}

#[tokio::test]
async fn test_exact_id_outranks_text_matches() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();

    let hits = cache.search(request("AutoUpdate", &["en-US"]), &cancel).await.unwrap();
    assert_eq!(hits[0].unique_id, "Fabrikam.Update:AutoUpdate");
    assert!(hits[0].score >= 1000.0);
}

#[tokio::test]
async fn test_description_field_is_opt_in() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();
    cache
        .scan_and_update(&cultures(&["en-US"]), &cancel)
        .await
        .unwrap();

    let plain = cache.search(request("reputation", &["en-US"]), &cancel).await.unwrap();
    assert!(plain.is_empty());

    let with_desc = cache
        .search(
            request("reputation", &["en-US"]).fields(SearchFields::with_description(true)),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(ids(&with_desc).into_iter().collect::<Vec<_>>(), vec!["Contoso.Browser:SmartScreenFilter"]);
}

#[tokio::test]
async fn test_invalid_arguments_are_reported() {
    let tree = PolicyTree::new();
    let cache = open_cache(tree.config("cache"), tree.path()).await;
    let cancel = CancellationToken::new();

    let err = cache.search(request("popups", &[]), &cancel).await.unwrap_err();
    assert!(policy_cache::CacheError::is_invalid_argument(&err));

    let err = cache.scan_and_update(&[], &cancel).await.unwrap_err();
    assert!(policy_cache::CacheError::is_invalid_argument(&err));
}
