use reel::{
    AutomationError, Backend, ElementInfo, PageModel, PageOperation, Point, SimulatedBackend,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn strict_mode_rejects_unknown_targets() {
    init_tracing();
    let backend = SimulatedBackend::new()
        .strict(true)
        .with_elements(vec![ElementInfo::new("button", "Save")]);

    assert!(backend.click("save").await.is_ok());
    let err = backend.click("Submit").await.unwrap_err();
    assert!(matches!(err, AutomationError::ElementNotFound(_)));
    assert_eq!(backend.calls_to("click").len(), 2);
}

#[tokio::test]
async fn lenient_mode_accepts_unknown_targets() {
    let backend = SimulatedBackend::new();
    backend.type_text("Email", "a@b.c").await.unwrap();
    assert_eq!(backend.typed_value("Email").as_deref(), Some("a@b.c"));
    assert_eq!(
        backend.focused_target().await.unwrap().as_deref(),
        Some("Email")
    );
}

#[tokio::test]
async fn disabled_elements_fail_in_strict_mode() {
    let backend = SimulatedBackend::new()
        .strict(true)
        .with_elements(vec![ElementInfo::new("button", "Pay").disabled()]);
    let err = backend.click("Pay").await.unwrap_err();
    assert!(matches!(err, AutomationError::ElementNotEnabled(_)));
}

#[tokio::test]
async fn history_follows_navigation_and_links() {
    let backend = SimulatedBackend::new()
        .with_location("https://shop.test/")
        .with_page(
            "https://shop.test/",
            PageModel::new("Shop").with_elements(vec![
                ElementInfo::new("link", "Cart").with_href("https://shop.test/cart")
            ]),
        );

    backend.click("Cart").await.unwrap();
    assert_eq!(backend.location(), "https://shop.test/cart");

    backend.perform(PageOperation::GoBack).await.unwrap();
    assert_eq!(backend.location(), "https://shop.test/");
    assert_eq!(backend.current_title().await.unwrap(), "Shop");

    backend.perform(PageOperation::GoForward).await.unwrap();
    assert_eq!(backend.location(), "https://shop.test/cart");
}

#[tokio::test]
async fn empty_url_is_a_navigation_failure() {
    let backend = SimulatedBackend::new();
    let err = backend.navigate("  ").await.unwrap_err();
    assert!(matches!(err, AutomationError::NavigationFailed(_)));
}

#[tokio::test]
async fn fingerprint_changes_with_typed_values() {
    let backend = SimulatedBackend::new();
    let before = backend.content_fingerprint().await.unwrap();
    backend.type_text("Name", "Ada").await.unwrap();
    let after = backend.content_fingerprint().await.unwrap();
    assert_ne!(before, after);
}

#[tokio::test]
async fn scroll_operations_update_offset() {
    let backend = SimulatedBackend::new();
    backend.scroll_to(Point::new(0.0, 250.0)).await.unwrap();
    assert_eq!(backend.scroll_offset().await.unwrap().y, 250.0);
    backend.perform(PageOperation::ScrollTop).await.unwrap();
    assert_eq!(backend.scroll_offset().await.unwrap().y, 0.0);
}

#[test]
fn page_operations_round_trip_through_names() {
    for op in PageOperation::ALL {
        assert_eq!(PageOperation::from_name(op.name()), Some(op));
    }
    assert_eq!(PageOperation::from_name("click"), None);
}
