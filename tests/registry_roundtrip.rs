use feature_registry::{
    bearer, Anchor, DerivedFeature, Feature, FeatureGraph, FeatureRef, FeatureType,
    MemoryRegistry, RegistryClient, RegistryConfig, RegistryError, Source, SourceKind,
    Transformation, TypedKey, ValueType,
};
use pretty_assertions::assert_eq;

fn location_key() -> Vec<TypedKey> {
    vec![TypedKey::new("DOLocationID", ValueType::Int32).with_description("drop-off location")]
}

fn feature(name: &str, expr: &str) -> Feature {
    Feature::new(name, FeatureType::scalar(ValueType::Float), location_key())
        .with_transformation(Transformation::expression(expr))
}

/// Two anchors over one batch source, one request-context anchor, and a
/// small derived chain.
fn taxi_graph() -> FeatureGraph {
    let mut graph = FeatureGraph::new();
    let batch = graph.add_source(
        Source::hdfs("nycTaxiBatchSource", "wasbs://public@feathr.blob/green_tripdata.csv")
            .with_event_timestamp("lpep_dropoff_datetime", "yyyy-MM-dd HH:mm:ss"),
    );
    let context = graph.add_source(Source::context());

    let distance = graph.add_feature(feature("f_trip_distance", "trip_distance"));
    let duration = graph.add_feature(feature(
        "f_trip_time_duration",
        "(to_unix_timestamp(lpep_dropoff_datetime) - to_unix_timestamp(lpep_pickup_datetime))/60",
    ));
    let avg_fare = graph.add_feature(
        Feature::new(
            "f_location_avg_fare",
            FeatureType::scalar(ValueType::Float),
            location_key(),
        )
        .with_transformation(Transformation::window_agg(
            "cast_float(fare_amount)",
            "AVG",
            "90d",
        )),
    );
    let is_long = graph.add_feature(
        Feature::new("f_is_long_trip", FeatureType::scalar(ValueType::Bool), Vec::new())
            .with_transformation(Transformation::expression("trip_distance > 30")),
    );

    graph.add_anchor(
        Anchor::new("nonAggFeatures", batch, vec![distance, duration]).with_tag("team", "ads"),
    );
    graph.add_anchor(Anchor::new("aggregationFeatures", batch, vec![avg_fare]));
    graph.add_anchor(Anchor::new("request_features", context, vec![is_long]));

    let speed = graph.add_derived(
        DerivedFeature::new(
            "f_trip_speed",
            FeatureType::scalar(ValueType::Float),
            location_key(),
            [FeatureRef::Anchored(distance), FeatureRef::Anchored(duration)],
        )
        .with_transformation(Transformation::expression(
            "f_trip_distance / f_trip_time_duration",
        )),
    );
    graph.add_derived(
        DerivedFeature::new(
            "f_speed_fare",
            FeatureType::scalar(ValueType::Float),
            location_key(),
            [FeatureRef::Derived(speed), FeatureRef::Anchored(avg_fare)],
        )
        .with_transformation(Transformation::expression("f_trip_speed * f_location_avg_fare")),
    );
    graph
}

fn client(project: &str) -> RegistryClient<MemoryRegistry> {
    RegistryClient::new(
        RegistryConfig::new("http://localhost:8000/api/v1", project),
        MemoryRegistry::new(),
    )
}

/// Names of a derived feature's inputs, in stored order.
fn input_names(graph: &FeatureGraph, name: &str) -> Vec<String> {
    let key = graph.find_derived(name).expect("derived feature");
    graph
        .derived(key)
        .inputs()
        .iter()
        .map(|input| graph.input_name(*input).to_string())
        .collect()
}

#[test]
fn register_then_fetch_reproduces_the_graph() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    let summary = client.register_features(&mut graph).unwrap();
    assert_eq!(summary.created, 11);

    let fetched = client.fetch_project("nyc_taxi").unwrap();
    assert_eq!(fetched.anchor_count(), 3);
    assert_eq!(fetched.derived_count(), 2);

    for (_, anchor) in graph.anchors() {
        let key = fetched.find_anchor(&anchor.name).expect("anchor fetched");
        let other = fetched.anchor(key);
        assert_eq!(other.registration, anchor.registration);
        assert_eq!(other.tags, anchor.tags);
        assert_eq!(fetched.source(other.source), graph.source(anchor.source));
        let names = |g: &FeatureGraph, keys: &[feature_registry::FeatureKey]| {
            let mut names: Vec<_> = keys.iter().map(|k| g.feature(*k).clone()).collect();
            names.sort_by(|a, b| a.name.cmp(&b.name));
            names
        };
        assert_eq!(names(&fetched, &other.features), names(&graph, &anchor.features));
    }

    for (_, derived) in graph.derived_features() {
        let key = fetched.find_derived(&derived.name).expect("derived fetched");
        let other = fetched.derived(key);
        assert_eq!(other.registration, derived.registration);
        assert_eq!(other.transformation, derived.transformation);
        assert_eq!(
            input_names(&fetched, &derived.name),
            input_names(&graph, &derived.name)
        );
    }
}

#[test]
fn fetched_anchors_share_one_source() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();

    let fetched = client.fetch_project("nyc_taxi").unwrap();
    let non_agg = fetched.anchor(fetched.find_anchor("nonAggFeatures").unwrap());
    let agg = fetched.anchor(fetched.find_anchor("aggregationFeatures").unwrap());
    assert_eq!(non_agg.source, agg.source);
    let request = fetched.anchor(fetched.find_anchor("request_features").unwrap());
    assert_eq!(fetched.source(request.source).kind, SourceKind::Context);
}

#[test]
fn fetched_derived_inputs_are_the_fetched_features() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();

    let fetched = client.fetch_project("nyc_taxi").unwrap();
    let agg = fetched.anchor(fetched.find_anchor("aggregationFeatures").unwrap());
    let speed = fetched.find_derived("f_trip_speed").unwrap();
    let speed_fare = fetched.derived(fetched.find_derived("f_speed_fare").unwrap());
    assert_eq!(
        speed_fare.inputs(),
        &[FeatureRef::Anchored(agg.features[0]), FeatureRef::Derived(speed)]
    );
}

#[test]
fn registering_twice_creates_nothing_new() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();
    let entities = client.session().entity_count();
    let calls = client.session().create_calls();

    let summary = client.register_features(&mut graph).unwrap();
    assert_eq!(summary.created, 0);
    // 2 sources + 3 anchors + 4 features + 2 derived, each counted once
    assert_eq!(summary.skipped, 11);
    assert_eq!(client.session().entity_count(), entities);
    assert_eq!(client.session().create_calls(), calls + 1);
}

#[test]
fn failed_registration_resumes_without_duplicates() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.session_mut().fail_creates_after(Some(6));

    let err = client.register_features(&mut graph).unwrap_err();
    assert!(matches!(err, RegistryError::RegistrationFailed { .. }), "{err:?}");

    client.session_mut().fail_creates_after(None);
    client.register_features(&mut graph).unwrap();

    // project + 2 sources + 3 anchors + 4 features + 2 derived
    assert_eq!(client.session().entity_count(), 12);
    let fetched = client.fetch_project("nyc_taxi").unwrap();
    assert_eq!(fetched.derived_count(), 2);
}

#[test]
fn cyclic_graph_makes_no_calls() {
    let mut graph = taxi_graph();
    let speed = graph.find_derived("f_trip_speed").unwrap();
    let speed_fare = graph.find_derived("f_speed_fare").unwrap();
    graph
        .add_input(speed, FeatureRef::Derived(speed_fare))
        .unwrap();

    let mut client = client("nyc_taxi");
    let err = client.register_features(&mut graph).unwrap_err();
    assert!(matches!(err, RegistryError::CyclicDependency { .. }));
    assert_eq!(client.session().create_calls(), 0);
}

#[test]
fn registered_derived_feature_cannot_gain_inputs() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();

    let speed = graph.find_derived("f_trip_speed").unwrap();
    let speed_fare = graph.find_derived("f_speed_fare").unwrap();
    assert!(matches!(
        graph.add_input(speed, FeatureRef::Derived(speed_fare)),
        Err(RegistryError::AlreadyRegistered { .. })
    ));
}

#[test]
fn bearer_auth_is_sent_unless_sandboxed() {
    let registry = MemoryRegistry::new().with_bearer_token("t0ken");
    let mut client = RegistryClient::new(
        RegistryConfig::new("http://localhost:8000/api/v1", "nyc_taxi"),
        registry,
    )
    .with_auth(bearer("t0ken"));
    let mut graph = taxi_graph();
    client.register_features(&mut graph).unwrap();
    assert_eq!(client.fetch_project("nyc_taxi").unwrap().anchor_count(), 3);

    let sandboxed = RegistryClient::new(
        RegistryConfig::new("http://localhost:8000/api/v1", "nyc_taxi").with_sandbox(true),
        client.into_session(),
    )
    .with_auth(bearer("t0ken"));
    let err = sandboxed.fetch_project("nyc_taxi").unwrap_err();
    assert!(matches!(err, RegistryError::Transport(ref t) if t.status == 401));
}

#[test]
fn lists_features_and_dependents() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();

    let mut names: Vec<String> = client
        .list_registered_features("nyc_taxi")
        .unwrap()
        .into_iter()
        .map(|f| f.qualified_name)
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "nyc_taxi__aggregationFeatures__f_location_avg_fare",
            "nyc_taxi__f_speed_fare",
            "nyc_taxi__f_trip_speed",
            "nyc_taxi__nonAggFeatures__f_trip_distance",
            "nyc_taxi__nonAggFeatures__f_trip_time_duration",
            "nyc_taxi__request_features__f_is_long_trip",
        ]
    );

    let dependents: Vec<String> = client
        .list_dependent_entities("nyc_taxi__f_trip_speed")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(dependents, vec!["f_speed_fare"]);
}

#[test]
fn delete_respects_dependents() {
    let mut graph = taxi_graph();
    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();

    let err = client.delete_entity("nyc_taxi__f_trip_speed").unwrap_err();
    assert!(matches!(err, RegistryError::Transport(ref t) if t.status == 400));

    client.delete_entity("nyc_taxi__f_speed_fare").unwrap();
    client.delete_entity("nyc_taxi__f_trip_speed").unwrap();
    let fetched = client.fetch_project("nyc_taxi").unwrap();
    assert_eq!(fetched.derived_count(), 0);
}

#[test]
fn context_source_gets_an_id_per_project() {
    let mut graph = taxi_graph();
    let mut first = client("first");
    first.register_features(&mut graph).unwrap();
    let request = graph.find_anchor("request_features").unwrap();
    let context = graph.anchor(request).source;
    let first_id = graph.source(context).registration.id().cloned().unwrap();

    let mut second = RegistryClient::new(
        RegistryConfig::new("http://localhost:8000/api/v1", "second"),
        first.into_session(),
    );
    second.register_features(&mut graph).unwrap();
    let second_id = graph.source(context).registration.id().cloned().unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(
        graph.source(context).registration.qualified_name(),
        Some("second__PASSTHROUGH")
    );
}

#[test]
fn invalid_project_name_is_rejected_before_any_call() {
    let mut graph = taxi_graph();
    let mut client = client("nyc__taxi");
    let err = client.register_features(&mut graph).unwrap_err();
    assert!(matches!(err, RegistryError::Config { .. }));
    assert_eq!(client.session().create_calls(), 0);
}

#[test]
fn renamed_context_source_survives_fetch() {
    let mut graph = FeatureGraph::new();
    let ctx = graph.add_source(Source::new("request_ctx", SourceKind::Context));
    let f = graph.add_feature(feature("f_len", "len(query)"));
    graph.add_anchor(Anchor::new("request_features", ctx, vec![f]));

    let mut client = client("nyc_taxi");
    client.register_features(&mut graph).unwrap();
    let fetched = client.fetch_project("nyc_taxi").unwrap();
    let anchor = fetched.anchor(fetched.find_anchor("request_features").unwrap());
    assert_eq!(fetched.source(anchor.source), graph.source(ctx));
}

#[test]
fn fetching_unknown_project_is_a_transport_error() {
    let client = client("nyc_taxi");
    let err = client.fetch_project("missing").unwrap_err();
    assert!(matches!(err, RegistryError::Transport(ref t) if t.status == 404));
}

#[test]
fn lineage_url_points_at_project() {
    let client = client("nyc_taxi");
    assert_eq!(
        client.lineage_url(),
        "http://localhost:8000/projects/nyc_taxi/lineage"
    );
}
