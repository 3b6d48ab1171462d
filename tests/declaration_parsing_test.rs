//! Declaration parsing tests using datatest-stable for test data discovery
//!
//! Every YAML file under `tests/testdata/services` is a `.envie` service
//! declaration that must parse, carry a valid name and resolve every
//! dependency reference to a service name.

use envie::config::parse_declaration;
use std::collections::HashSet;
use std::path::Path;

fn test_declaration_parsing(path: &Path) -> datatest_stable::Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read test file {}: {}", path.display(), e))?;

    let declaration = parse_declaration(&content)
        .map_err(|e| format!("Failed to parse declaration from {}: {}", path.display(), e))?;

    assert!(
        !declaration.name.is_empty(),
        "Declaration in {} has an empty name",
        path.display()
    );

    let mut seen = HashSet::new();
    for (idx, dependency) in declaration.depends.iter().enumerate() {
        let name = dependency.service_name().map_err(|e| {
            format!(
                "Dependency {} in {} does not resolve: {}",
                idx,
                path.display(),
                e
            )
        })?;
        assert!(
            !name.contains('/'),
            "Dependency {} in {} resolved to a path: {}",
            idx,
            path.display(),
            name
        );
        assert_ne!(
            name,
            declaration.name,
            "{} depends on itself",
            path.display()
        );
        seen.insert(name);
    }
    assert_eq!(
        seen.len(),
        declaration.depends.len(),
        "{} lists a dependency twice",
        path.display()
    );

    Ok(())
}

datatest_stable::harness!(
    test_declaration_parsing,
    "tests/testdata/services",
    r".*\.yaml$"
);
