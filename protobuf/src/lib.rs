tonic::include_proto!("protobuf");
