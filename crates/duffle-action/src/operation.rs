//! Building the [`Operation`] handed to a driver

use duffle_core::{Bundle, Claim, CoreError, InvocationImage, Set};
use duffle_driver::{Driver, Operation, Output};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ActionError, Result};

/// Where the bundle's component images are written inside the invocation image
pub const IMAGE_MAP_PATH: &str = "/cnab/app/image-map.json";

/// First invocation image the driver can run
pub async fn select_invocation_image(driver: &dyn Driver, bundle: &Bundle) -> Result<InvocationImage> {
    if bundle.invocation_images.is_empty() {
        return Err(ActionError::NoInvocationImages);
    }

    for image in &bundle.invocation_images {
        if driver.handles(&image.image_type).await {
            return Ok(image.clone());
        }
    }
    Err(ActionError::NoCompatibleInvocationImage)
}

/// Environment form of a parameter value; strings are not quoted
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Assemble the operation for running `action` against `claim`
///
/// Fails without side effects when the bundle is missing, when the resolved
/// credentials do not cover the bundle's requirements, or when the claim's
/// parameters do not fit the bundle's definitions.
pub fn build_operation(
    action: &str,
    claim: &Claim,
    image: &InvocationImage,
    creds: &Set,
    out: Output,
) -> Result<Operation> {
    let bundle = claim.bundle.as_ref().ok_or_else(|| ActionError::MissingBundle {
        name: claim.name.clone(),
    })?;

    creds
        .validate(&bundle.credentials)
        .map_err(ActionError::Credentials)?;

    if let Some(name) = claim
        .parameters
        .keys()
        .find(|name| !bundle.parameters.contains_key(*name))
    {
        return Err(ActionError::UndefinedParameter { name: name.clone() });
    }
    for (name, definition) in &bundle.parameters {
        if definition.required
            && definition.applies_to(action)
            && !claim.parameters.contains_key(name)
        {
            return Err(ActionError::MissingParameter {
                name: name.clone(),
                action: action.to_string(),
            });
        }
    }

    let (mut environment, mut files) = creds.flatten();

    environment.insert("CNAB_INSTALLATION_NAME".to_string(), claim.name.clone());
    environment.insert("CNAB_ACTION".to_string(), action.to_string());
    environment.insert("CNAB_BUNDLE_NAME".to_string(), bundle.name.clone());
    environment.insert("CNAB_BUNDLE_VERSION".to_string(), bundle.version.clone());

    for (name, value) in &claim.parameters {
        let rendered = render(value);
        environment.insert(format!("CNAB_P_{}", name.to_uppercase()), rendered.clone());

        let Some(destination) = bundle.parameters.get(name).and_then(|d| d.destination.as_ref())
        else {
            continue;
        };
        if let Some(var) = destination.env.as_deref().filter(|v| !v.is_empty()) {
            environment.insert(var.to_string(), rendered.clone());
        }
        if let Some(path) = destination.path.as_deref().filter(|p| !p.is_empty()) {
            files.insert(path.to_string(), rendered);
        }
    }

    let image_map = serde_json::to_string(&bundle.images).map_err(CoreError::from)?;
    files.insert(IMAGE_MAP_PATH.to_string(), image_map);

    Ok(Operation {
        installation: claim.name.clone(),
        revision: claim.revision.clone(),
        action: action.to_string(),
        parameters: claim.parameters.clone(),
        credentials: creds.names(),
        image: image.image.clone(),
        image_type: image.image_type.clone(),
        environment,
        files,
        out,
    })
}

/// Parameters of `claim` with bundle defaults filled in
pub fn resolved_parameters(bundle: &Bundle, supplied: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
    bundle.values_or_defaults(supplied).map_err(|e| match e {
        CoreError::UndefinedParameter { name } => ActionError::UndefinedParameter { name },
        other => ActionError::Core(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SpyDriver, sample_bundle};
    use duffle_core::Destination;
    use serde_json::json;

    fn claim() -> Claim {
        let mut claim = Claim::new("myrelease").unwrap().with_bundle(sample_bundle());
        claim.parameters.insert("replicas".to_string(), json!(3));
        claim.parameters.insert("region".to_string(), json!("eu"));
        claim
    }

    fn kubeconfig() -> Set {
        let mut set = Set::new();
        set.insert(
            "kubeconfig",
            Destination {
                path: Some("/root/.kube/config".to_string()),
                env: None,
                value: "apiVersion: v1".to_string(),
            },
        );
        set
    }

    #[tokio::test]
    async fn test_select_first_handled_image() {
        let mut bundle = sample_bundle();
        bundle.invocation_images.insert(
            0,
            InvocationImage {
                image_type: "qcow".to_string(),
                image: "foo.qcow".to_string(),
                digest: None,
            },
        );

        let driver = SpyDriver::refusing(&["qcow"]);
        let image = select_invocation_image(&driver, &bundle).await.unwrap();
        assert_eq!(image.image_type, "docker");

        let driver = SpyDriver::refusing(&["qcow", "docker"]);
        assert!(matches!(
            select_invocation_image(&driver, &bundle).await,
            Err(ActionError::NoCompatibleInvocationImage)
        ));

        bundle.invocation_images.clear();
        assert!(matches!(
            select_invocation_image(&driver, &bundle).await,
            Err(ActionError::NoInvocationImages)
        ));
    }

    #[test]
    fn test_environment() {
        let claim = claim();
        let image = &claim.bundle.as_ref().unwrap().invocation_images[0];
        let op = build_operation("install", &claim, image, &kubeconfig(), Output::capture().0).unwrap();

        assert_eq!(op.installation, "myrelease");
        assert_eq!(op.revision, claim.revision);
        assert_eq!(op.image, "technosophos/foo:1.0.0");
        assert_eq!(op.credentials, vec!["kubeconfig"]);

        let env = &op.environment;
        assert_eq!(env["CNAB_INSTALLATION_NAME"], "myrelease");
        assert_eq!(env["CNAB_ACTION"], "install");
        assert_eq!(env["CNAB_BUNDLE_NAME"], "foo");
        assert_eq!(env["CNAB_BUNDLE_VERSION"], "1.0.0");
        assert_eq!(env["CNAB_P_REPLICAS"], "3");
        assert_eq!(env["CNAB_P_REGION"], "eu");
        // destination.env of "region"
        assert_eq!(env["REGION"], "eu");
    }

    #[test]
    fn test_files() {
        let claim = claim();
        let image = &claim.bundle.as_ref().unwrap().invocation_images[0];
        let op = build_operation("install", &claim, image, &kubeconfig(), Output::capture().0).unwrap();

        assert_eq!(op.files["/root/.kube/config"], "apiVersion: v1");
        assert_eq!(op.files["/cnab/app/replicas"], "3");
        let map: Value = serde_json::from_str(&op.files[IMAGE_MAP_PATH]).unwrap();
        assert_eq!(map["web"]["image"], "nginx:1.25");
    }

    #[test]
    fn test_missing_credential() {
        let claim = claim();
        let image = &claim.bundle.as_ref().unwrap().invocation_images[0];
        let err = build_operation("install", &claim, image, &Set::new(), Output::capture().0).unwrap_err();
        assert!(matches!(err, ActionError::Credentials(_)));
        assert_eq!(err.to_string(), "bundle requires credential for kubeconfig");
    }

    #[test]
    fn test_parameter_checks() {
        let mut claim = claim();
        let image = claim.bundle.as_ref().unwrap().invocation_images[0].clone();

        claim.parameters.insert("bogus".to_string(), json!(1));
        assert!(matches!(
            build_operation("install", &claim, &image, &kubeconfig(), Output::capture().0),
            Err(ActionError::UndefinedParameter { .. })
        ));

        claim.parameters.remove("bogus");
        claim.parameters.remove("region");
        let err = build_operation("install", &claim, &image, &kubeconfig(), Output::capture().0).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"missing required parameter "region" for action "install""#
        );

        // "region" only applies to install and upgrade
        assert!(build_operation("uninstall", &claim, &image, &kubeconfig(), Output::capture().0).is_ok());
    }

    #[test]
    fn test_missing_bundle() {
        let claim = Claim::new("bare").unwrap();
        let image = sample_bundle().invocation_images[0].clone();
        assert!(matches!(
            build_operation("install", &claim, &image, &Set::new(), Output::capture().0),
            Err(ActionError::MissingBundle { .. })
        ));
    }

    #[test]
    fn test_resolved_parameters() {
        let bundle = sample_bundle();
        let supplied = BTreeMap::from([("region".to_string(), json!("us"))]);
        let resolved = resolved_parameters(&bundle, &supplied).unwrap();
        assert_eq!(resolved["replicas"], json!(1));
        assert_eq!(resolved["region"], json!("us"));

        let supplied = BTreeMap::from([("nope".to_string(), json!(1))]);
        assert!(matches!(
            resolved_parameters(&bundle, &supplied),
            Err(ActionError::UndefinedParameter { .. })
        ));
    }
}
