#![cfg(feature = "serde")]

use heddle::{
    ContextBuilder, ContextConfig,
    loom::{
        flow::FlowPosition,
        memory::MB,
        num::DType,
        ops::{OpDependency, OpDependencyCoordinate, OpDependencyDescriptor},
        shape::{SlicedTensorShape, TensorShape},
        task::Status,
    },
};

#[test]
fn test_config() {
    let config: ContextConfig = serde_json::from_str(r#"{ "heap_limit": 2000000 }"#).unwrap();
    assert!(config.heap);
    assert_eq!(config.heap_limit, 2 * MB);
    assert_eq!(config.heap_max_allocations, u64::MAX);

    let context = ContextBuilder::from(config.clone()).build();
    assert_eq!(context.heap().unwrap().descriptor().max_usage, 2 * MB);

    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(serde_json::from_str::<ContextConfig>(&json).unwrap(), config);
}

#[test]
fn test_shapes() {
    let shape = TensorShape::new([5, 3, 2]).unwrap();
    assert_eq!(serde_json::to_string(&shape).unwrap(), "[5,3,2]");
    assert!(serde_json::from_str::<TensorShape>("[5,0,2]").is_err());
    assert!(serde_json::from_str::<TensorShape>("[]").is_err());

    let sliced = SlicedTensorShape::new(shape, [1, 1, 0], [3, 2, 2]).unwrap();
    let json = serde_json::to_string(&sliced).unwrap();
    assert_eq!(serde_json::from_str::<SlicedTensorShape>(&json).unwrap(), sliced);
}

#[test]
fn test_descriptors() {
    let row = FlowPosition::new(4, 8, 4, 20);
    let json = serde_json::to_string(&row).unwrap();
    assert_eq!(serde_json::from_str::<FlowPosition>(&json).unwrap(), row);

    let dependencies = OpDependencyDescriptor::new([2], [2]).with(
        0,
        0,
        OpDependencyCoordinate::new(0, 1, OpDependency::NearestNeighbor { k: 2, padding: 1 }),
    );
    let json = serde_json::to_string(&dependencies).unwrap();
    assert_eq!(
        serde_json::from_str::<OpDependencyDescriptor>(&json).unwrap(),
        dependencies
    );

    assert_eq!(serde_json::to_string(&DType::Float16).unwrap(), r#""Float16""#);
    assert_eq!(serde_json::to_string(&Status::SUCCESS).unwrap(), "40");
}
